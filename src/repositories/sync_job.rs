//! # SyncJob Repository
//!
//! Persistence for sync jobs. Every status change is a conditional update
//! filtered on the expected current status, so concurrent workers racing on
//! the same job cannot both win.

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, sea_query::Expr,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::enums::{JobStatus, JobType, SyncDirection};
use crate::models::sync_job::{ActiveModel, Column, Entity, JobSummary, Model};

/// Fields required to persist a new PENDING job.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub provider_slug: String,
    pub job_type: JobType,
    pub direction: SyncDirection,
    pub priority: i16,
    pub patient_id: Option<String>,
    pub resource_types: Vec<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTimeWithTimeZone>,
    pub max_attempts: i32,
}

/// Optional filters for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub connection_id: Option<Uuid>,
    pub status: Option<JobStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Repository for sync job database operations
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
}

impl SyncJobRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, job: NewSyncJob) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        ActiveModel {
            id: Set(job.id),
            connection_id: Set(job.connection_id),
            provider_slug: Set(job.provider_slug),
            job_type: Set(job.job_type),
            direction: Set(job.direction),
            priority: Set(job.priority),
            status: Set(JobStatus::Pending),
            patient_id: Set(job.patient_id),
            resource_types: Set(serde_json::json!(job.resource_types)),
            resource_id: Set(job.resource_id),
            since: Set(job.since),
            attempt_count: Set(0),
            max_attempts: Set(job.max_attempts),
            last_error: Set(None),
            records_processed: Set(0),
            records_stored: Set(0),
            records_pushed: Set(0),
            records_failed: Set(0),
            conflicts_detected: Set(0),
            conflicts_resolved: Set(0),
            bytes_transferred: Set(0),
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&self.db).await
    }

    /// Newest jobs first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_asc(Column::Id);

        if let Some(connection_id) = filter.connection_id {
            query = query.filter(Column::ConnectionId.eq(connection_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }

        query
            .offset(filter.offset.unwrap_or(0))
            .limit(filter.limit.unwrap_or(100))
            .all(&self.db)
            .await
    }

    /// Atomically moves a PENDING or RETRYING job to PROCESSING and consumes one
    /// attempt. Returns the claimed row, or `None` when another worker (or a
    /// terminal status) got there first.
    pub async fn claim(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Processing))
            .col_expr(Column::AttemptCount, Expr::col(Column::AttemptCount).add(1))
            .col_expr(Column::StartedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in([JobStatus::Pending, JobStatus::Retrying]))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    /// PROCESSING -> COMPLETED with the result summary.
    pub async fn complete(&self, id: Uuid, summary: &JobSummary) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();
        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Completed))
            .col_expr(Column::RecordsProcessed, Expr::value(summary.records_processed))
            .col_expr(Column::RecordsStored, Expr::value(summary.records_stored))
            .col_expr(Column::RecordsPushed, Expr::value(summary.records_pushed))
            .col_expr(Column::RecordsFailed, Expr::value(summary.records_failed))
            .col_expr(Column::ConflictsDetected, Expr::value(summary.conflicts_detected))
            .col_expr(Column::ConflictsResolved, Expr::value(summary.conflicts_resolved))
            .col_expr(Column::BytesTransferred, Expr::value(summary.bytes_transferred))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(JobStatus::Processing))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// PROCESSING -> RETRYING, keeping the failure for inspection.
    pub async fn mark_retrying(&self, id: Uuid, last_error: JsonValue) -> Result<bool, DbErr> {
        self.transition(id, JobStatus::Processing, JobStatus::Retrying, |update| {
            update.col_expr(Column::LastError, Expr::value(last_error))
        })
        .await
    }

    /// PROCESSING -> FAILED with the terminal failure and whatever partial summary exists.
    pub async fn mark_failed(
        &self,
        id: Uuid,
        last_error: JsonValue,
        summary: &JobSummary,
    ) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();
        self.transition(id, JobStatus::Processing, JobStatus::Failed, |update| {
            update
                .col_expr(Column::LastError, Expr::value(last_error))
                .col_expr(Column::RecordsProcessed, Expr::value(summary.records_processed))
                .col_expr(Column::RecordsStored, Expr::value(summary.records_stored))
                .col_expr(Column::RecordsPushed, Expr::value(summary.records_pushed))
                .col_expr(Column::RecordsFailed, Expr::value(summary.records_failed))
                .col_expr(Column::ConflictsDetected, Expr::value(summary.conflicts_detected))
                .col_expr(Column::ConflictsResolved, Expr::value(summary.conflicts_resolved))
                .col_expr(Column::BytesTransferred, Expr::value(summary.bytes_transferred))
                .col_expr(Column::CompletedAt, Expr::value(now))
        })
        .await
    }

    /// `from` -> CANCELLED.
    pub async fn mark_cancelled(&self, id: Uuid, from: JobStatus) -> Result<bool, DbErr> {
        let now = Utc::now().fixed_offset();
        self.transition(id, from, JobStatus::Cancelled, |update| {
            update.col_expr(Column::CompletedAt, Expr::value(now))
        })
        .await
    }

    /// FAILED -> RETRYING with a fresh attempt budget.
    pub async fn reset_for_retry(&self, id: Uuid) -> Result<bool, DbErr> {
        self.transition(id, JobStatus::Failed, JobStatus::Retrying, |update| {
            update
                .col_expr(Column::AttemptCount, Expr::value(0))
                .col_expr(Column::CompletedAt, Expr::value(Option::<DateTimeWithTimeZone>::None))
        })
        .await
    }

    async fn transition<F>(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
        extra: F,
    ) -> Result<bool, DbErr>
    where
        F: FnOnce(sea_orm::UpdateMany<Entity>) -> sea_orm::UpdateMany<Entity>,
    {
        debug_assert!(from.can_transition_to(to), "{from:?} -> {to:?}");
        let update = Entity::update_many()
            .col_expr(Column::Status, Expr::value(to))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now().fixed_offset()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(from));
        let result = extra(update).exec(&self.db).await?;
        Ok(result.rows_affected == 1)
    }

    /// Jobs a restarted process must put back on the queue.
    pub async fn list_recoverable(&self) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.is_in([JobStatus::Pending, JobStatus::Retrying]))
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    /// PROCESSING jobs whose attempt started before `started_before`.
    pub async fn list_stale_processing(
        &self,
        started_before: DateTimeWithTimeZone,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Status.eq(JobStatus::Processing))
            .filter(Column::StartedAt.lt(started_before))
            .all(&self.db)
            .await
    }

    /// Whether the connection already has a job waiting or running.
    pub async fn has_open_job(&self, connection_id: Uuid) -> Result<bool, DbErr> {
        let open = Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Status.is_in([
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Retrying,
            ]))
            .count(&self.db)
            .await?;
        Ok(open > 0)
    }

    /// Deletes finished jobs older than their retention window. Errors cascade.
    pub async fn purge_finished(
        &self,
        completed_before: DateTimeWithTimeZone,
        failed_before: DateTimeWithTimeZone,
    ) -> Result<u64, DbErr> {
        let result = Entity::delete_many()
            .filter(
                Condition::any()
                    .add(
                        Condition::all()
                            .add(
                                Column::Status
                                    .is_in([JobStatus::Completed, JobStatus::Cancelled]),
                            )
                            .add(Column::UpdatedAt.lt(completed_before)),
                    )
                    .add(
                        Condition::all()
                            .add(Column::Status.eq(JobStatus::Failed))
                            .add(Column::UpdatedAt.lt(failed_before)),
                    ),
            )
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
