//! SyncConflict entity model
//!
//! A conflict records two diverging versions of one logical resource and how
//! (or whether) the divergence was settled.

use super::enums::{ConflictStatus, ConflictStrategy};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_conflicts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Job that detected the conflict, if any
    pub job_id: Option<Uuid>,

    pub connection_id: Uuid,

    pub provider_slug: String,

    pub resource_type: String,

    pub resource_id: String,

    /// Canonical (platform) version at detection time
    #[sea_orm(column_type = "JsonBinary")]
    pub local_value: JsonValue,

    /// Provider version at detection time
    #[sea_orm(column_type = "JsonBinary")]
    pub remote_value: JsonValue,

    pub local_modified_at: Option<DateTimeWithTimeZone>,

    pub remote_modified_at: Option<DateTimeWithTimeZone>,

    pub status: ConflictStatus,

    /// Strategy applied at detection, or the manual decision's strategy
    pub strategy: ConflictStrategy,

    /// `{"winner": ..., "record": ...}` once resolved
    #[sea_orm(column_type = "JsonBinary")]
    pub outcome: Option<JsonValue>,

    /// Why automatic resolution did not settle the conflict
    pub escalation_reason: Option<String>,

    /// `system` for automatic resolutions, otherwise the operator identity
    pub resolved_by: Option<String>,

    pub reason: Option<String>,

    pub detected_at: DateTimeWithTimeZone,

    pub resolved_at: Option<DateTimeWithTimeZone>,

    /// Set once the resolved record has been pushed back to the provider
    pub propagated_at: Option<DateTimeWithTimeZone>,

    /// Last error of a propagation the queue gave up on
    pub propagation_error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
