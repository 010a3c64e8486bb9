//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which describes one configured link to an external EHR system.

use super::enums::{ConflictStrategy, ConnectionStatus, SyncDirection};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Connection entity representing a link to one EHR provider account
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Slug of the provider adapter serving this connection (e.g. `epic`)
    pub provider_slug: String,

    pub display_name: String,

    /// Only ACTIVE connections accept new jobs
    pub status: ConnectionStatus,

    /// Overrides the provider's configured base URL
    pub base_url: Option<String>,

    /// Provider credentials, e.g. `{"access_token": "..."}`
    #[sea_orm(column_type = "JsonBinary")]
    pub credentials: Option<JsonValue>,

    /// JSON array of resource types jobs may touch; empty means unrestricted
    #[sea_orm(column_type = "JsonBinary")]
    pub permitted_resource_types: JsonValue,

    /// Directions jobs on this connection may run in
    pub sync_direction: SyncDirection,

    /// Connection-level conflict strategy override
    pub conflict_strategy: Option<ConflictStrategy>,

    /// Interval for scheduled incremental syncs; falls back to the scheduler default
    pub sync_interval_seconds: Option<i64>,

    /// Completion time of the last successful sync
    pub last_synced_at: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Resource types this connection may sync; empty means unrestricted.
    pub fn permitted_types(&self) -> Vec<String> {
        self.permitted_resource_types
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJob,
    #[sea_orm(has_many = "super::webhook_config::Entity")]
    WebhookConfig,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl Related<super::webhook_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WebhookConfig.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
