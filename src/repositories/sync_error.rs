//! Append-only store of per-job errors.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::enums::{ErrorSeverity, FailureKind};
use crate::models::sync_error::{ActiveModel, Column, Entity, Model};

/// One error row to append.
#[derive(Debug, Clone)]
pub struct NewSyncError {
    pub job_id: Uuid,
    pub kind: FailureKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub resource_ref: Option<String>,
    pub context: Option<JsonValue>,
    pub terminal: bool,
}

#[derive(Debug, Clone)]
pub struct SyncErrorRepository {
    db: DatabaseConnection,
}

impl SyncErrorRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn record(&self, error: NewSyncError) -> Result<Model, DbErr> {
        ActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(error.job_id),
            code: Set(error.kind.error_code().to_string()),
            kind: Set(error.kind),
            severity: Set(error.severity),
            message: Set(error.message),
            resource_ref: Set(error.resource_ref),
            context: Set(error.context),
            terminal: Set(error.terminal),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await
    }

    /// Errors for a job in the order they were recorded.
    pub async fn list_for_job(&self, job_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
    }

    pub async fn count_terminal(&self, job_id: Uuid) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::JobId.eq(job_id))
            .filter(Column::Terminal.eq(true))
            .count(&self.db)
            .await
    }
}
