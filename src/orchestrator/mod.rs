//! # Sync Orchestrator
//!
//! Creates sync jobs, runs their attempts, and owns the job lifecycle
//! operations (retry, cancel, recovery, retention). Durable job state lives in
//! `sync_jobs`; the queue only carries job ids, and every attempt starts with
//! a conditional claim so duplicate deliveries are no-ops.

mod execute;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::collaborators::{ActiveConnection, Collaborators};
use crate::config::{AppConfig, OrchestratorConfig};
use crate::conflicts::ConflictService;
use crate::error::SyncFailure;
use crate::events::{EventBus, SyncEvent};
use crate::models::enums::{ErrorSeverity, JobStatus, JobType, SyncDirection};
use crate::models::sync_error::Model as SyncErrorModel;
use crate::models::sync_job::{JobSummary, Model as SyncJobModel};
use crate::pipeline::TransformationPipeline;
use crate::queue::{
    DEFAULT_PRIORITY, JobOptions, JobQueues, MAX_PRIORITY, MIN_PRIORITY, QueueError, SyncJobTask,
};
use crate::repositories::sync_error::NewSyncError;
use crate::repositories::sync_job::{JobFilter, NewSyncJob};
use crate::repositories::{
    ConnectionRepository, SyncErrorRepository, SyncJobRepository, TransformationRuleRepository,
};
use crate::statistics::StatisticsService;

pub use execute::{IngestOutcome, ProcessOutcome};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("connection {0} is not active")]
    ConnectionInactive(Uuid),
    #[error("cannot {operation} job {job_id} while it is {status:?}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        operation: &'static str,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl OrchestratorError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }
}

/// A request to synchronize one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub connection_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub direction: SyncDirection,
    /// 1 = critical ... 5 = background
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// A job together with the errors recorded against it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDetails {
    pub job: SyncJobModel,
    pub errors: Vec<SyncErrorModel>,
}

pub struct Orchestrator {
    jobs: SyncJobRepository,
    errors: SyncErrorRepository,
    connections: ConnectionRepository,
    pipeline: TransformationPipeline,
    collaborators: Collaborators,
    adapters: Arc<AdapterRegistry>,
    conflicts: Arc<ConflictService>,
    queues: JobQueues,
    events: EventBus,
    statistics: Arc<StatisticsService>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        config: &AppConfig,
        collaborators: Collaborators,
        adapters: Arc<AdapterRegistry>,
        conflicts: Arc<ConflictService>,
        queues: JobQueues,
        events: EventBus,
        statistics: Arc<StatisticsService>,
    ) -> Self {
        Self {
            jobs: SyncJobRepository::new(db.clone()),
            errors: SyncErrorRepository::new(db.clone()),
            connections: ConnectionRepository::new(db.clone()),
            pipeline: TransformationPipeline::new(TransformationRuleRepository::new(db)),
            collaborators,
            adapters,
            conflicts,
            queues,
            events,
            statistics,
            config: config.orchestrator.clone(),
        }
    }

    /// Counts the event into the daily statistics, then hands it to subscribers.
    async fn emit(&self, event: SyncEvent) {
        self.statistics.record_or_log(&event).await;
        self.events.publish(event);
    }

    /// Validates the request, persists a PENDING job and enqueues it.
    pub async fn create_job(&self, spec: JobSpec) -> Result<SyncJobModel, OrchestratorError> {
        self.insert_job(Uuid::new_v4(), spec).await
    }

    /// Like [`create_job`](Self::create_job), but at most once per `job_id`:
    /// when a job with that id already exists it is returned as is, and a
    /// PENDING one is re-enqueued (the queue drops the duplicate).
    pub async fn create_keyed_job(
        &self,
        job_id: Uuid,
        spec: JobSpec,
    ) -> Result<SyncJobModel, OrchestratorError> {
        if let Some(existing) = self.jobs.find_by_id(job_id).await? {
            if existing.status == JobStatus::Pending {
                self.enqueue(&existing).await?;
            }
            tracing::debug!(job_id = %job_id, status = ?existing.status, "Keyed job already exists");
            return Ok(existing);
        }
        self.insert_job(job_id, spec).await
    }

    async fn insert_job(&self, job_id: Uuid, spec: JobSpec) -> Result<SyncJobModel, OrchestratorError> {
        let priority = spec.priority.unwrap_or(DEFAULT_PRIORITY);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(OrchestratorError::validation(
                "priority",
                format!("priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}"),
            ));
        }
        let max_attempts = spec
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if !(1..=50).contains(&max_attempts) {
            return Err(OrchestratorError::validation(
                "maxAttempts",
                "maxAttempts must be between 1 and 50",
            ));
        }

        let connection = self.active_connection(spec.connection_id).await?;
        if !connection.sync_direction.permits(spec.direction) {
            return Err(OrchestratorError::validation(
                "direction",
                format!(
                    "connection is configured for {:?} sync",
                    connection.sync_direction
                ),
            ));
        }

        let resource_types = scoped_resource_types(&connection, spec.resource_types)?;
        if spec.job_type == JobType::SingleResource {
            if spec.resource_id.as_deref().is_none_or(str::is_empty) {
                return Err(OrchestratorError::validation(
                    "resourceId",
                    "SINGLE_RESOURCE jobs require resourceId",
                ));
            }
            if resource_types.len() != 1 {
                return Err(OrchestratorError::validation(
                    "resourceTypes",
                    "SINGLE_RESOURCE jobs take exactly one resource type",
                ));
            }
        }

        let job = self
            .jobs
            .insert(NewSyncJob {
                id: job_id,
                connection_id: connection.id,
                provider_slug: connection.provider_slug.clone(),
                job_type: spec.job_type,
                direction: spec.direction,
                priority: i16::from(priority),
                patient_id: spec.patient_id,
                resource_types,
                resource_id: spec.resource_id,
                since: spec.since.map(|at| at.fixed_offset()),
                max_attempts: max_attempts as i32,
            })
            .await?;

        if let Err(error) = self.enqueue(&job).await {
            // Do not leave a PENDING row that nothing will run until restart.
            self.jobs.mark_cancelled(job.id, JobStatus::Pending).await?;
            return Err(error.into());
        }

        tracing::info!(
            job_id = %job.id,
            connection_id = %job.connection_id,
            provider = %job.provider_slug,
            job_type = ?job.job_type,
            direction = ?job.direction,
            priority,
            "Sync job created"
        );
        Ok(job)
    }

    async fn enqueue(&self, job: &SyncJobModel) -> Result<String, QueueError> {
        let priority = u8::try_from(job.priority).unwrap_or(DEFAULT_PRIORITY);
        match self
            .queues
            .sync_jobs
            .enqueue(
                SyncJobTask { job_id: job.id },
                JobOptions::new()
                    .job_id(job.id.to_string())
                    .priority(priority)
                    .max_attempts(job.remaining_attempts()),
            )
            .await
        {
            Err(QueueError::DuplicateJob { job_id, .. }) => Ok(job_id),
            other => other,
        }
    }

    async fn active_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<ActiveConnection, OrchestratorError> {
        if let Some(connection) = self
            .collaborators
            .directory
            .get_active_connection(connection_id)
            .await?
        {
            return Ok(connection);
        }
        match self.connections.find_by_id(connection_id).await? {
            Some(_) => Err(OrchestratorError::ConnectionInactive(connection_id)),
            None => Err(OrchestratorError::NotFound {
                entity: "connection",
                id: connection_id.to_string(),
            }),
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<JobDetails, OrchestratorError> {
        let job = self.find_job(job_id).await?;
        let errors = self.errors.list_for_job(job_id).await?;
        Ok(JobDetails { job, errors })
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<SyncJobModel>, OrchestratorError> {
        Ok(self.jobs.list(filter).await?)
    }

    pub async fn list_errors(&self, job_id: Uuid) -> Result<Vec<SyncErrorModel>, OrchestratorError> {
        self.find_job(job_id).await?;
        Ok(self.errors.list_for_job(job_id).await?)
    }

    async fn find_job(&self, job_id: Uuid) -> Result<SyncJobModel, OrchestratorError> {
        self.jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })
    }

    /// Puts a FAILED job back on the queue as RETRYING with a fresh attempt budget.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<SyncJobModel, OrchestratorError> {
        let job = self.find_job(job_id).await?;
        if job.status != JobStatus::Failed || !self.jobs.reset_for_retry(job_id).await? {
            return Err(OrchestratorError::InvalidState {
                job_id,
                status: job.status,
                operation: "retry",
            });
        }
        let job = self.find_job(job_id).await?;
        self.enqueue(&job).await?;
        tracing::info!(job_id = %job_id, "Failed sync job re-enqueued");
        Ok(job)
    }

    /// Cancels a PENDING or RETRYING job outright, or flags a PROCESSING one
    /// so its worker stops at the next record boundary.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<SyncJobModel, OrchestratorError> {
        let job = self.find_job(job_id).await?;
        let cancelled = match job.status {
            JobStatus::Pending | JobStatus::Retrying | JobStatus::Processing => {
                self.jobs.mark_cancelled(job_id, job.status).await?
            }
            _ => false,
        };
        if !cancelled {
            let current = self.find_job(job_id).await?;
            return Err(OrchestratorError::InvalidState {
                job_id,
                status: current.status,
                operation: "cancel",
            });
        }

        let signal = self.queues.sync_jobs.cancel(&job_id.to_string()).await;
        tracing::info!(job_id = %job_id, from = ?job.status, queue = ?signal, "Sync job cancelled");
        self.find_job(job_id).await
    }

    /// Re-enqueues work left behind by a previous process: stale PROCESSING
    /// attempts go to RETRYING (or FAILED when out of attempts), then every
    /// PENDING/RETRYING job is queued again.
    pub async fn recover_pending(&self) -> Result<usize, OrchestratorError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.job_timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        for job in self.jobs.list_stale_processing(cutoff.fixed_offset()).await? {
            let failure = SyncFailure::timeout("attempt interrupted before it finished");
            if job.attempt_count < job.max_attempts {
                self.jobs.mark_retrying(job.id, failure.to_json()).await?;
            } else if self
                .jobs
                .mark_failed(job.id, failure.to_json(), &JobSummary::from(&job))
                .await?
            {
                self.record_terminal_error(&job, &failure, ErrorSeverity::Critical)
                    .await?;
            }
        }

        let recoverable = self.jobs.list_recoverable().await?;
        let count = recoverable.len();
        for job in &recoverable {
            self.enqueue(job).await?;
        }
        if count > 0 {
            tracing::info!(count, "Recovered sync jobs onto the queue");
        }
        Ok(count)
    }

    /// Deletes finished jobs past their retention windows.
    pub async fn purge_expired(&self) -> Result<u64, OrchestratorError> {
        let now = Utc::now();
        let completed_before =
            now - chrono::Duration::days(self.config.completed_retention_days as i64);
        let failed_before = now - chrono::Duration::days(self.config.failed_retention_days as i64);
        let purged = self
            .jobs
            .purge_finished(completed_before.fixed_offset(), failed_before.fixed_offset())
            .await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired sync jobs");
        }
        Ok(purged)
    }

    async fn record_terminal_error(
        &self,
        job: &SyncJobModel,
        failure: &SyncFailure,
        severity: ErrorSeverity,
    ) -> Result<(), DbErr> {
        self.errors
            .record(NewSyncError {
                job_id: job.id,
                kind: failure.kind,
                severity,
                message: failure.message.clone(),
                resource_ref: failure.resource_ref.clone(),
                context: Some(serde_json::json!({
                    "attempt": job.attempt_count,
                    "maxAttempts": job.max_attempts,
                    "retryable": failure.retryable,
                })),
                terminal: true,
            })
            .await
            .map(|_| ())
    }
}

/// Resolves the job's resource types against what the connection permits.
fn scoped_resource_types(
    connection: &ActiveConnection,
    requested: Vec<String>,
) -> Result<Vec<String>, OrchestratorError> {
    let requested: Vec<String> = requested
        .into_iter()
        .map(|resource_type| resource_type.trim().to_string())
        .filter(|resource_type| !resource_type.is_empty())
        .collect();

    if requested.is_empty() {
        if connection.permitted_resource_types.is_empty() {
            return Err(OrchestratorError::validation(
                "resourceTypes",
                "resourceTypes is required for connections without a permitted list",
            ));
        }
        return Ok(connection.permitted_resource_types.clone());
    }

    if let Some(denied) = requested
        .iter()
        .find(|resource_type| !connection.permits_resource_type(resource_type))
    {
        return Err(OrchestratorError::validation(
            "resourceTypes",
            format!("resource type {denied} is not permitted for this connection"),
        ));
    }
    Ok(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(permitted: &[&str]) -> ActiveConnection {
        ActiveConnection {
            id: Uuid::new_v4(),
            provider_slug: "epic".to_string(),
            display_name: "Epic".to_string(),
            base_url: None,
            credentials: None,
            permitted_resource_types: permitted.iter().map(|s| s.to_string()).collect(),
            sync_direction: SyncDirection::Bidirectional,
            conflict_strategy: None,
            sync_interval_seconds: None,
            last_synced_at: None,
        }
    }

    #[test]
    fn empty_request_falls_back_to_permitted_types() {
        let types = scoped_resource_types(&connection(&["Patient", "Observation"]), vec![]).unwrap();
        assert_eq!(types, vec!["Patient", "Observation"]);
    }

    #[test]
    fn unpermitted_type_is_rejected() {
        let error =
            scoped_resource_types(&connection(&["Patient"]), vec!["Observation".into()]).unwrap_err();
        assert!(matches!(
            error,
            OrchestratorError::Validation { field: Some(ref f), .. } if f == "resourceTypes"
        ));
    }

    #[test]
    fn open_connection_requires_explicit_types() {
        assert!(scoped_resource_types(&connection(&[]), vec![" ".into()]).is_err());
        let types = scoped_resource_types(&connection(&[]), vec!["Encounter".into()]).unwrap();
        assert_eq!(types, vec!["Encounter"]);
    }

    #[test]
    fn job_spec_uses_type_field() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "connectionId": Uuid::nil(),
            "type": "INCREMENTAL",
            "direction": "INBOUND",
            "resourceTypes": ["Observation"],
        }))
        .unwrap();
        assert_eq!(spec.job_type, JobType::Incremental);
        assert_eq!(spec.priority, None);
        assert!(spec.patient_id.is_none());
    }
}
