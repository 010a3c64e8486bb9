//! One attempt of a sync job: pull, transform, reconcile, push.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Orchestrator;
use crate::adapters::{AdapterError, ProviderRecord, PullRequest};
use crate::collaborators::{ActiveConnection, CriticalAlert, RecordKey};
use crate::config::OrchestratorConfig;
use crate::conflicts::{DetectedConflict, Resolution, VersionedRecord, Winner};
use crate::error::SyncFailure;
use crate::events::SyncEvent;
use crate::models::enums::{ErrorSeverity, FailureKind, JobStatus, JobType};
use crate::models::sync_job::{JobSummary, Model as SyncJobModel};
use crate::pipeline::{PipelineDirection, RuleSet};
use crate::queue::{JobFailure, TransformTask};
use crate::repositories::sync_error::NewSyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The job was not PENDING/RETRYING when the attempt tried to claim it
    Skipped,
    Completed(JobSummary),
    Cancelled,
}

/// What happened to one inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    /// Identical to the canonical copy; nothing written
    Unchanged,
    ConflictResolved { stored: bool },
    ConflictEscalated,
}

impl IngestOutcome {
    fn tally(self, summary: &mut JobSummary) {
        match self {
            IngestOutcome::Stored => summary.records_stored += 1,
            IngestOutcome::Unchanged => {}
            IngestOutcome::ConflictResolved { stored } => {
                summary.conflicts_detected += 1;
                summary.conflicts_resolved += 1;
                if stored {
                    summary.records_stored += 1;
                }
            }
            IngestOutcome::ConflictEscalated => summary.conflicts_detected += 1,
        }
    }

    fn wrote(self) -> bool {
        matches!(
            self,
            IngestOutcome::Stored | IngestOutcome::ConflictResolved { stored: true }
        )
    }
}

enum AttemptEnd {
    Finished,
    Cancelled,
}

/// Record-scoped failures are tallied; job-scoped ones end the attempt.
enum RecordError {
    Record(SyncFailure),
    Job(SyncFailure),
}

impl RecordError {
    fn into_failure(self) -> SyncFailure {
        match self {
            RecordError::Record(failure) | RecordError::Job(failure) => failure,
        }
    }
}

fn db_retry(error: sea_orm::DbErr) -> JobFailure {
    JobFailure::Retry(format!("job state update failed: {error}"))
}

/// Whether per-record failures have crossed the configured abort threshold.
pub(super) fn threshold_exceeded(config: &OrchestratorConfig, summary: &JobSummary) -> bool {
    let failed = summary.records_failed.max(0) as u32;
    if config.max_record_failures.is_some_and(|max| failed >= max) {
        return true;
    }
    let processed = summary.records_processed.max(0) as u32;
    processed >= config.failure_rate_min_records
        && processed > 0
        && f64::from(failed) / f64::from(processed) > config.max_record_failure_rate
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

impl Orchestrator {
    /// Runs one attempt of `job_id`. Jobs that are not PENDING/RETRYING are
    /// left untouched and reported as [`ProcessOutcome::Skipped`].
    pub async fn process_job(
        &self,
        job_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, JobFailure> {
        let Some(job) = self.jobs.claim(job_id).await.map_err(db_retry)? else {
            tracing::debug!(job_id = %job_id, "Job not claimable; skipping");
            return Ok(ProcessOutcome::Skipped);
        };

        let attempt = job.attempt_count.max(1) as u32;
        let started = Instant::now();
        tracing::info!(
            job_id = %job.id,
            provider = %job.provider_slug,
            attempt,
            max_attempts = job.max_attempts,
            "Sync job attempt started"
        );

        let mut summary = JobSummary::default();
        let result = tokio::time::timeout(
            self.config.job_timeout(),
            self.run_attempt(&job, cancel, &mut summary),
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;
        histogram!("sync_job_duration_ms", "provider" => job.provider_slug.clone())
            .record(duration_ms as f64);

        match result {
            Ok(Ok(AttemptEnd::Finished)) => {
                self.finish_completed(&job, summary, attempt, duration_ms)
                    .await
            }
            Ok(Ok(AttemptEnd::Cancelled)) => self.finish_cancelled(&job).await,
            Ok(Err(failure)) => {
                self.finish_failed(&job, failure, summary, attempt, duration_ms)
                    .await
            }
            Err(_) => {
                let failure = SyncFailure::timeout(format!(
                    "job exceeded its {}s execution budget",
                    self.config.job_timeout_seconds
                ));
                self.finish_failed(&job, failure, summary, attempt, duration_ms)
                    .await
            }
        }
    }

    async fn finish_completed(
        &self,
        job: &SyncJobModel,
        summary: JobSummary,
        attempt: u32,
        duration_ms: u64,
    ) -> Result<ProcessOutcome, JobFailure> {
        if !self.jobs.complete(job.id, &summary).await.map_err(db_retry)? {
            tracing::info!(job_id = %job.id, "Job was cancelled while running; keeping CANCELLED");
            return Ok(ProcessOutcome::Cancelled);
        }

        let completed_at = Utc::now();
        if let Err(error) = self
            .connections
            .mark_synced(job.connection_id, completed_at.fixed_offset())
            .await
        {
            tracing::warn!(connection_id = %job.connection_id, error = %error, "Failed to record last sync time");
        }

        counter!("sync_jobs_total", "outcome" => "completed").increment(1);
        tracing::info!(
            job_id = %job.id,
            attempt,
            duration_ms,
            records_processed = summary.records_processed,
            records_stored = summary.records_stored,
            records_pushed = summary.records_pushed,
            records_failed = summary.records_failed,
            conflicts_detected = summary.conflicts_detected,
            "Sync job completed"
        );
        self.emit(SyncEvent::JobCompleted {
            job_id: job.id,
            connection_id: job.connection_id,
            provider_slug: job.provider_slug.clone(),
            attempt,
            summary,
            duration_ms,
            completed_at,
        })
        .await;
        Ok(ProcessOutcome::Completed(summary))
    }

    async fn finish_cancelled(&self, job: &SyncJobModel) -> Result<ProcessOutcome, JobFailure> {
        let current = self.jobs.find_by_id(job.id).await.map_err(db_retry)?;
        if current.is_some_and(|current| current.status == JobStatus::Cancelled) {
            counter!("sync_jobs_total", "outcome" => "cancelled").increment(1);
            tracing::info!(job_id = %job.id, "Sync job stopped after cancellation");
        } else {
            // Interrupted by shutdown; recovery picks it up on the next start.
            let failure = SyncFailure::timeout("attempt interrupted by shutdown");
            self.jobs
                .mark_retrying(job.id, failure.to_json())
                .await
                .map_err(db_retry)?;
            tracing::warn!(job_id = %job.id, "Sync job interrupted; left RETRYING");
        }
        Ok(ProcessOutcome::Cancelled)
    }

    async fn finish_failed(
        &self,
        job: &SyncJobModel,
        failure: SyncFailure,
        summary: JobSummary,
        attempt: u32,
        duration_ms: u64,
    ) -> Result<ProcessOutcome, JobFailure> {
        let exhausted = failure.retryable && attempt >= job.max_attempts.max(1) as u32;

        if failure.retryable && !exhausted {
            if !self
                .jobs
                .mark_retrying(job.id, failure.to_json())
                .await
                .map_err(db_retry)?
            {
                return Ok(ProcessOutcome::Cancelled);
            }
            counter!("sync_jobs_total", "outcome" => "retrying").increment(1);
            tracing::warn!(
                job_id = %job.id,
                attempt,
                max_attempts = job.max_attempts,
                code = failure.code(),
                error = %failure.message,
                "Sync job attempt failed; retrying"
            );
            return Err(JobFailure::Retry(failure.message));
        }

        if !self
            .jobs
            .mark_failed(job.id, failure.to_json(), &summary)
            .await
            .map_err(db_retry)?
        {
            return Ok(ProcessOutcome::Cancelled);
        }

        let severity = if exhausted {
            ErrorSeverity::Critical
        } else {
            ErrorSeverity::Error
        };
        if let Err(error) = self.record_terminal_error(job, &failure, severity).await {
            tracing::error!(job_id = %job.id, error = %error, "Failed to record terminal sync error");
        }
        if exhausted {
            self.collaborators
                .notifier
                .notify(CriticalAlert {
                    severity,
                    code: failure.code().to_string(),
                    message: format!(
                        "sync job {} failed after {attempt} attempts: {}",
                        job.id, failure.message
                    ),
                    job_id: Some(job.id),
                    connection_id: Some(job.connection_id),
                    webhook_config_id: None,
                })
                .await;
        }

        counter!("sync_jobs_total", "outcome" => "failed").increment(1);
        tracing::error!(
            job_id = %job.id,
            attempt,
            code = failure.code(),
            retryable = failure.retryable,
            error = %failure.message,
            "Sync job failed"
        );
        self.emit(SyncEvent::JobFailed {
            job_id: job.id,
            connection_id: job.connection_id,
            provider_slug: job.provider_slug.clone(),
            attempt,
            failure: failure.clone(),
            summary,
            duration_ms,
            failed_at: Utc::now(),
        })
        .await;
        Err(JobFailure::Fatal(failure.message))
    }

    async fn run_attempt(
        &self,
        job: &SyncJobModel,
        cancel: &CancellationToken,
        summary: &mut JobSummary,
    ) -> Result<AttemptEnd, SyncFailure> {
        let connection = self
            .collaborators
            .directory
            .get_active_connection(job.connection_id)
            .await?
            .ok_or_else(|| {
                SyncFailure::fatal(
                    FailureKind::Validation,
                    format!("connection {} is not active", job.connection_id),
                )
            })?;
        let adapter = self.adapters.get(&job.provider_slug).ok_or_else(|| {
            SyncFailure::fatal(
                FailureKind::Validation,
                format!("no adapter registered for {}", job.provider_slug),
            )
        })?;

        let resource_types: Vec<String> = job
            .resource_type_list()
            .into_iter()
            .filter(|resource_type| connection.permits_resource_type(resource_type))
            .collect();
        if resource_types.is_empty() {
            return Err(SyncFailure::fatal(
                FailureKind::Validation,
                "no permitted resource types in scope",
            ));
        }

        let since = job
            .since
            .map(|at| at.with_timezone(&Utc))
            .or(match job.job_type {
                JobType::Incremental => connection.last_synced_at,
                _ => None,
            });
        let mut rules: HashMap<String, RuleSet> = HashMap::new();
        let mut written: HashSet<RecordKey> = HashSet::new();

        if job.direction.includes_inbound() {
            let request = PullRequest {
                job_type: job.job_type,
                resource_types: resource_types.clone(),
                patient_id: job.patient_id.clone(),
                resource_id: job.resource_id.clone(),
                since,
            };
            let pulled = self
                .call_adapter("pull", adapter.pull(&connection, &request))
                .await?;
            summary.bytes_transferred += pulled.bytes_transferred as i64;

            let mut records = pulled.records;
            records.sort_by(|a, b| {
                (a.resource_type.as_str(), a.resource_id.as_str())
                    .cmp(&(b.resource_type.as_str(), b.resource_id.as_str()))
            });

            for record in records {
                if cancel.is_cancelled() {
                    return Ok(AttemptEnd::Cancelled);
                }
                if !connection.permits_resource_type(&record.resource_type) {
                    tracing::debug!(
                        job_id = %job.id,
                        resource_type = %record.resource_type,
                        "Skipping record outside the connection's permitted types"
                    );
                    continue;
                }
                summary.records_processed += 1;

                let rule_set = self
                    .rules_for(&mut rules, &job.provider_slug, &record.resource_type)
                    .await?;
                match self
                    .ingest(&connection, Some(job.id), &record, rule_set)
                    .await
                {
                    Ok(outcome) => {
                        outcome.tally(summary);
                        if outcome.wrote() {
                            written.insert(RecordKey::new(
                                connection.id,
                                record.resource_type.clone(),
                                record.resource_id.clone(),
                            ));
                        }
                        if outcome == IngestOutcome::ConflictEscalated {
                            self.record_warning(
                                job.id,
                                SyncFailure::fatal(
                                    FailureKind::ConflictUnresolvable,
                                    "conflict escalated to manual review",
                                )
                                .with_resource(format!(
                                    "{}/{}",
                                    record.resource_type, record.resource_id
                                )),
                            )
                            .await?;
                        }
                    }
                    Err(RecordError::Record(failure)) => {
                        self.record_failure(job, failure, summary).await?
                    }
                    Err(RecordError::Job(failure)) => return Err(failure),
                }
            }
        }

        if job.direction.includes_outbound() {
            let mut local = self
                .collaborators
                .store
                .changed_since(connection.id, &resource_types, since)
                .await?;
            if job.job_type == JobType::SingleResource {
                local.retain(|record| Some(&record.key.resource_id) == job.resource_id.as_ref());
            }
            local.sort_by(|a, b| a.key.cmp(&b.key));

            for stored in local {
                if cancel.is_cancelled() {
                    return Ok(AttemptEnd::Cancelled);
                }
                if written.contains(&stored.key) {
                    continue;
                }
                summary.records_processed += 1;
                let reference = stored.key.reference();

                let rule_set = self
                    .rules_for(&mut rules, &job.provider_slug, &stored.key.resource_type)
                    .await?;
                let payload = match rule_set.apply(&stored.data, PipelineDirection::Outbound) {
                    Ok(payload) => payload,
                    Err(error) if error.is_record_scoped() => {
                        let failure = SyncFailure::from(error).with_resource(reference);
                        self.record_failure(job, failure, summary).await?;
                        continue;
                    }
                    Err(error) => return Err(error.into()),
                };

                let record = ProviderRecord {
                    resource_type: stored.key.resource_type.clone(),
                    resource_id: stored.key.resource_id.clone(),
                    data: payload,
                    modified_at: stored.modified_at,
                };
                match self
                    .call_adapter("push", adapter.push(&connection, &record))
                    .await
                {
                    Ok(pushed) => {
                        summary.records_pushed += 1;
                        summary.bytes_transferred += pushed.bytes_transferred as i64;
                    }
                    Err(failure) if failure.retryable => {
                        return Err(failure.with_resource(reference));
                    }
                    Err(failure) => {
                        self.record_failure(job, failure.with_resource(reference), summary)
                            .await?
                    }
                }
            }
        }

        Ok(AttemptEnd::Finished)
    }

    async fn call_adapter<T, F>(&self, operation: &'static str, call: F) -> Result<T, SyncFailure>
    where
        F: Future<Output = Result<T, AdapterError>>,
    {
        match tokio::time::timeout(self.config.adapter_timeout(), call).await {
            Ok(result) => result.map_err(SyncFailure::from),
            Err(_) => Err(SyncFailure::timeout(format!(
                "adapter {operation} exceeded {}s",
                self.config.adapter_timeout_seconds
            ))),
        }
    }

    async fn rules_for<'a>(
        &self,
        cache: &'a mut HashMap<String, RuleSet>,
        provider_slug: &str,
        resource_type: &str,
    ) -> Result<&'a RuleSet, SyncFailure> {
        if !cache.contains_key(resource_type) {
            let rule_set = self.pipeline.load(provider_slug, resource_type).await?;
            cache.insert(resource_type.to_string(), rule_set);
        }
        cache.get(resource_type).ok_or_else(|| {
            SyncFailure::new(
                FailureKind::Transformation,
                format!("rules for {resource_type} unavailable"),
            )
        })
    }

    async fn record_warning(&self, job_id: Uuid, failure: SyncFailure) -> Result<(), SyncFailure> {
        self.errors
            .record(NewSyncError {
                job_id,
                kind: failure.kind,
                severity: ErrorSeverity::Warning,
                message: failure.message.clone(),
                resource_ref: failure.resource_ref.clone(),
                context: Some(failure.to_json()),
                terminal: false,
            })
            .await?;
        Ok(())
    }

    async fn record_failure(
        &self,
        job: &SyncJobModel,
        failure: SyncFailure,
        summary: &mut JobSummary,
    ) -> Result<(), SyncFailure> {
        summary.records_failed += 1;
        tracing::warn!(
            job_id = %job.id,
            resource = ?failure.resource_ref,
            code = failure.code(),
            error = %failure.message,
            "Record failed"
        );
        self.record_warning(job.id, failure).await?;

        if threshold_exceeded(&self.config, summary) {
            return Err(SyncFailure::fatal(
                FailureKind::Transformation,
                format!(
                    "{} of {} records failed; aborting job",
                    summary.records_failed, summary.records_processed
                ),
            ));
        }
        Ok(())
    }

    /// Transforms one provider record and reconciles it with the canonical copy.
    async fn ingest(
        &self,
        connection: &ActiveConnection,
        job_id: Option<Uuid>,
        record: &ProviderRecord,
        rules: &RuleSet,
    ) -> Result<IngestOutcome, RecordError> {
        let reference = format!("{}/{}", record.resource_type, record.resource_id);
        let canonical = rules
            .apply(&record.data, PipelineDirection::Inbound)
            .map_err(|error| {
                if error.is_record_scoped() {
                    RecordError::Record(SyncFailure::from(error).with_resource(reference.clone()))
                } else {
                    RecordError::Job(error.into())
                }
            })?;

        let store = &self.collaborators.store;
        let key = RecordKey::new(
            connection.id,
            record.resource_type.clone(),
            record.resource_id.clone(),
        );
        let existing = store
            .get(&key)
            .await
            .map_err(|error| RecordError::Job(error.into()))?;

        let Some(local) = existing else {
            store
                .put(&key, canonical, record.modified_at)
                .await
                .map_err(|error| RecordError::Job(error.into()))?;
            return Ok(IngestOutcome::Stored);
        };
        if local.data == canonical {
            return Ok(IngestOutcome::Unchanged);
        }

        let local_modified_at = local.modified_at;
        let decision = self
            .conflicts
            .detect_and_resolve(DetectedConflict {
                job_id,
                connection,
                resource_type: &record.resource_type,
                resource_id: &record.resource_id,
                local: VersionedRecord {
                    data: local.data,
                    modified_at: local_modified_at,
                },
                remote: VersionedRecord {
                    data: canonical,
                    modified_at: record.modified_at,
                },
            })
            .await
            .map_err(|error| {
                RecordError::Job(
                    SyncFailure::new(FailureKind::Persistence, error.to_string())
                        .with_resource(reference.clone()),
                )
            })?;

        match decision.resolution {
            Resolution::Resolved {
                winner: Winner::Local,
                ..
            } => Ok(IngestOutcome::ConflictResolved { stored: false }),
            Resolution::Resolved { winner, record: resolved } => {
                let modified_at = match winner {
                    Winner::Remote => record.modified_at,
                    _ => latest(local_modified_at, record.modified_at),
                };
                store
                    .put(&key, resolved, modified_at)
                    .await
                    .map_err(|error| RecordError::Job(error.into()))?;
                Ok(IngestOutcome::ConflictResolved { stored: true })
            }
            Resolution::Escalated { .. } => Ok(IngestOutcome::ConflictEscalated),
        }
    }

    /// Stores a provider record delivered outside a sync job, e.g. inline in a webhook.
    pub async fn ingest_task(&self, task: TransformTask) -> Result<IngestOutcome, SyncFailure> {
        let connection = self
            .collaborators
            .directory
            .get_active_connection(task.connection_id)
            .await?
            .ok_or_else(|| {
                SyncFailure::fatal(
                    FailureKind::Validation,
                    format!("connection {} is not active", task.connection_id),
                )
            })?;
        if !connection.sync_direction.includes_inbound()
            || !connection.permits_resource_type(&task.resource_type)
        {
            return Err(SyncFailure::fatal(
                FailureKind::Validation,
                format!(
                    "connection {} does not accept inbound {}",
                    connection.id, task.resource_type
                ),
            ));
        }

        let rules = self
            .pipeline
            .load(&connection.provider_slug, &task.resource_type)
            .await?;
        let record = ProviderRecord {
            resource_type: task.resource_type,
            resource_id: task.resource_id,
            data: task.record,
            modified_at: task.modified_at,
        };
        let outcome = self
            .ingest(&connection, None, &record, &rules)
            .await
            .map_err(RecordError::into_failure)?;
        tracing::debug!(
            connection_id = %connection.id,
            resource = %format!("{}/{}", record.resource_type, record.resource_id),
            ?outcome,
            "Inline record ingested"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(processed: i32, failed: i32) -> JobSummary {
        JobSummary {
            records_processed: processed,
            records_failed: failed,
            ..JobSummary::default()
        }
    }

    #[test]
    fn failure_rate_needs_minimum_sample() {
        let config = OrchestratorConfig {
            max_record_failure_rate: 0.5,
            failure_rate_min_records: 10,
            ..OrchestratorConfig::default()
        };
        assert!(!threshold_exceeded(&config, &summary(4, 4)));
        assert!(!threshold_exceeded(&config, &summary(10, 5)));
        assert!(threshold_exceeded(&config, &summary(10, 6)));
    }

    #[test]
    fn absolute_failure_cap_applies_immediately() {
        let config = OrchestratorConfig {
            max_record_failures: Some(2),
            ..OrchestratorConfig::default()
        };
        assert!(!threshold_exceeded(&config, &summary(1, 1)));
        assert!(threshold_exceeded(&config, &summary(2, 2)));
    }

    #[test]
    fn conflicts_count_towards_summary() {
        let mut totals = JobSummary::default();
        IngestOutcome::Stored.tally(&mut totals);
        IngestOutcome::Stored.tally(&mut totals);
        IngestOutcome::ConflictResolved { stored: false }.tally(&mut totals);
        IngestOutcome::ConflictEscalated.tally(&mut totals);
        assert_eq!(totals.records_stored, 2);
        assert_eq!(totals.conflicts_detected, 2);
        assert_eq!(totals.conflicts_resolved, 1);
    }

    #[test]
    fn latest_prefers_newer_timestamp() {
        let older = "2026-01-01T00:00:00Z".parse::<DateTime<Utc>>().ok();
        let newer = "2026-02-01T00:00:00Z".parse::<DateTime<Utc>>().ok();
        assert_eq!(latest(older, newer), newer);
        assert_eq!(latest(None, older), older);
        assert_eq!(latest(None, None), None);
    }
}
