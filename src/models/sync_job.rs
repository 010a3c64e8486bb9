//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table,
//! which represents one requested synchronization run against a connection.

use super::connection::Entity as Connection;
use super::enums::{JobStatus, JobType, SyncDirection};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// SyncJob entity representing a requested or scheduled sync run
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Connection this job runs against
    pub connection_id: Uuid,

    /// Provider slug copied from the connection at creation time
    pub provider_slug: String,

    pub job_type: JobType,

    pub direction: SyncDirection,

    /// 1 = critical ... 5 = background
    pub priority: i16,

    /// Current lifecycle status; only moves forward
    pub status: JobStatus,

    /// Optional patient scope
    pub patient_id: Option<String>,

    /// JSON array of resource types in scope
    #[sea_orm(column_type = "JsonBinary")]
    pub resource_types: JsonValue,

    /// Target resource for SINGLE_RESOURCE jobs
    pub resource_id: Option<String>,

    /// Lower bound on modification time for incremental pulls
    pub since: Option<DateTimeWithTimeZone>,

    /// Attempts consumed so far; incremented atomically on each claim
    pub attempt_count: i32,

    pub max_attempts: i32,

    /// Last failure details (kind, message, retryable)
    #[sea_orm(column_type = "JsonBinary")]
    pub last_error: Option<JsonValue>,

    pub records_processed: i32,
    pub records_stored: i32,
    pub records_pushed: i32,
    pub records_failed: i32,
    pub conflicts_detected: i32,
    pub conflicts_resolved: i32,
    pub bytes_transferred: i64,

    pub created_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn resource_type_list(&self) -> Vec<String> {
        self.resource_types
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Attempts still available to the queue for this job.
    pub fn remaining_attempts(&self) -> u32 {
        (self.max_attempts - self.attempt_count).max(1) as u32
    }
}

/// Counters produced by one attempt of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub records_processed: i32,
    pub records_stored: i32,
    pub records_pushed: i32,
    pub records_failed: i32,
    pub conflicts_detected: i32,
    pub conflicts_resolved: i32,
    pub bytes_transferred: i64,
}

impl From<&Model> for JobSummary {
    fn from(job: &Model) -> Self {
        Self {
            records_processed: job.records_processed,
            records_stored: job.records_stored,
            records_pushed: job.records_pushed,
            records_failed: job.records_failed,
            conflicts_detected: job.conflicts_detected,
            conflicts_resolved: job.conflicts_resolved,
            bytes_transferred: job.bytes_transferred,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Connection",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
    #[sea_orm(has_many = "super::sync_error::Entity")]
    SyncError,
}

impl Related<Connection> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl Related<super::sync_error::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncError.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
