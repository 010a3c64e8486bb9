//! # Data Models
//!
//! SeaORM entities for every table the sync engine owns, plus the shared
//! enumerations stored in them.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod canonical_record;
pub mod connection;
pub mod enums;
pub mod sync_conflict;
pub mod sync_error;
pub mod sync_job;
pub mod sync_statistics;
pub mod transformation_rule;
pub mod webhook_config;
pub mod webhook_log;

pub use canonical_record::Entity as CanonicalRecord;
pub use connection::Entity as Connection;
pub use sync_conflict::Entity as SyncConflict;
pub use sync_error::Entity as SyncError;
pub use sync_job::Entity as SyncJob;
pub use sync_statistics::Entity as SyncStatistics;
pub use transformation_rule::Entity as TransformationRule;
pub use webhook_config::Entity as WebhookConfig;
pub use webhook_log::Entity as WebhookLog;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "ehr-sync".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
