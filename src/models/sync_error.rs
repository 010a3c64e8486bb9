//! SyncError entity model: immutable failure records owned by a sync job.

use super::enums::{ErrorSeverity, FailureKind};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "sync_errors")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    /// Stable machine code, e.g. `TRANSFORMATION_FAILED`
    pub code: String,

    pub kind: FailureKind,

    pub severity: ErrorSeverity,

    pub message: String,

    /// `ResourceType/id` of the record that failed, for record-scoped errors
    pub resource_ref: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub context: Option<JsonValue>,

    /// True for the single error that ended the job
    pub terminal: bool,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::sync_job::Entity",
        from = "Column::JobId",
        to = "super::sync_job::Column::Id"
    )]
    SyncJob,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
