//! # Conflict Service
//!
//! Records detected divergences, applies the configured strategy once at
//! detection, and handles manual resolution and propagation of the resolved
//! record back to the provider.
//!
//! A conflict row is written exactly once in its post-detection state
//! (AUTO_RESOLVED or OPEN). Manual resolution is a conditional OPEN ->
//! RESOLVED/IGNORED update, so resolving twice returns the first outcome and
//! never reapplies side effects.

pub mod resolver;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use sea_orm::{DatabaseConnection, DbErr, Set};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, ProviderRecord};
use crate::collaborators::{
    ActiveConnection, ConnectionDirectory, CriticalAlert, Notifier, RecordKey, RecordStore,
};
use crate::config::AppConfig;
use crate::error::SyncFailure;
use crate::events::{EventBus, SyncEvent};
use crate::models::enums::{ConflictStatus, ConflictStrategy, ErrorSeverity, FailureKind};
use crate::models::sync_conflict::{self, Model as ConflictModel};
use crate::pipeline::{PipelineDirection, TransformationPipeline};
use crate::queue::{ConflictTask, JobOptions, JobQueues, QueueError};
use crate::repositories::sync_conflict::{ConflictFilter, ConflictResolution};
use crate::repositories::sync_error::NewSyncError;
use crate::repositories::{
    SyncConflictRepository, SyncErrorRepository, TransformationRuleRepository,
};
use crate::statistics::StatisticsService;

pub use resolver::{ConflictPolicy, Resolution, VersionedRecord, Winner, resolve};

pub const SYSTEM_RESOLVER: &str = "system";
const PROPAGATION_PRIORITY: u8 = 2;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("conflict {0} not found")]
    NotFound(Uuid),
    #[error("{0}")]
    Validation(String),
    #[error("record store rejected the resolved record: {0}")]
    Store(String),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// An operator's decision on an OPEN conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualDecision {
    KeepLocal,
    KeepRemote,
    LastWriteWins,
    SourcePriority,
    FieldLevelMerge,
    Ignore,
}

impl ManualDecision {
    fn strategy(self) -> ConflictStrategy {
        match self {
            ManualDecision::LastWriteWins => ConflictStrategy::LastWriteWins,
            ManualDecision::SourcePriority => ConflictStrategy::SourcePriority,
            ManualDecision::FieldLevelMerge => ConflictStrategy::FieldLevelMerge,
            ManualDecision::KeepLocal | ManualDecision::KeepRemote | ManualDecision::Ignore => {
                ConflictStrategy::ManualReview
            }
        }
    }

    /// Whether the provider must receive the resolved record.
    fn needs_propagation(self, winner: Winner) -> bool {
        !matches!(self, ManualDecision::Ignore | ManualDecision::KeepRemote)
            && winner != Winner::Remote
    }
}

/// A divergence found while processing a record.
#[derive(Debug, Clone)]
pub struct DetectedConflict<'a> {
    pub job_id: Option<Uuid>,
    pub connection: &'a ActiveConnection,
    pub resource_type: &'a str,
    pub resource_id: &'a str,
    pub local: VersionedRecord,
    pub remote: VersionedRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDecision {
    pub conflict_id: Uuid,
    pub strategy: ConflictStrategy,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub conflict: ConflictModel,
    /// The record that now stands, `None` when the conflict was ignored
    pub record: Option<JsonValue>,
    /// True when the conflict had already been settled before this call
    pub already_resolved: bool,
    pub propagation_job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationOutcome {
    Pushed,
    AlreadyPropagated,
    /// Nothing to push (ignored, or resolved in the provider's favour)
    Skipped,
}

fn outcome_json(winner: Winner, record: &JsonValue, decision: Option<ManualDecision>) -> JsonValue {
    serde_json::json!({
        "winner": winner,
        "record": record,
        "decision": decision,
    })
}

fn outcome_record(conflict: &ConflictModel) -> Option<JsonValue> {
    conflict
        .outcome
        .as_ref()
        .and_then(|outcome| outcome.get("record"))
        .filter(|record| !record.is_null())
        .cloned()
}

fn outcome_winner(conflict: &ConflictModel) -> Option<Winner> {
    let winner = conflict
        .outcome
        .as_ref()
        .and_then(|outcome| outcome.get("winner"))
        .and_then(JsonValue::as_str)?;
    match winner {
        "LOCAL" => Some(Winner::Local),
        "REMOTE" => Some(Winner::Remote),
        "MERGED" => Some(Winner::Merged),
        _ => None,
    }
}

pub struct ConflictService {
    conflicts: SyncConflictRepository,
    errors: SyncErrorRepository,
    pipeline: TransformationPipeline,
    store: Arc<dyn RecordStore>,
    directory: Arc<dyn ConnectionDirectory>,
    notifier: Arc<dyn Notifier>,
    adapters: Arc<AdapterRegistry>,
    queues: JobQueues,
    events: EventBus,
    statistics: Arc<StatisticsService>,
    policy: ConflictPolicy,
    adapter_timeout: Duration,
}

impl ConflictService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        config: &AppConfig,
        store: Arc<dyn RecordStore>,
        directory: Arc<dyn ConnectionDirectory>,
        notifier: Arc<dyn Notifier>,
        adapters: Arc<AdapterRegistry>,
        queues: JobQueues,
        events: EventBus,
        statistics: Arc<StatisticsService>,
    ) -> Self {
        Self {
            conflicts: SyncConflictRepository::new(db.clone()),
            errors: SyncErrorRepository::new(db.clone()),
            pipeline: TransformationPipeline::new(TransformationRuleRepository::new(db)),
            store,
            directory,
            notifier,
            adapters,
            queues,
            events,
            statistics,
            policy: ConflictPolicy::new(config.conflicts.clone()),
            adapter_timeout: config.orchestrator.adapter_timeout(),
        }
    }

    /// Applies the configured strategy once and records the conflict in its
    /// final detection state.
    pub async fn detect_and_resolve(
        &self,
        detected: DetectedConflict<'_>,
    ) -> Result<ConflictDecision, ConflictError> {
        let connection = detected.connection;
        let strategy = self
            .policy
            .strategy_for(detected.resource_type, connection.conflict_strategy);
        let resolution = resolve(
            strategy,
            self.policy.source_priority(),
            &detected.local,
            &detected.remote,
        );

        let now = Utc::now().fixed_offset();
        let (status, outcome, escalation_reason, resolved_by, resolved_at) = match &resolution {
            Resolution::Resolved { winner, record } => (
                ConflictStatus::AutoResolved,
                Some(outcome_json(*winner, record, None)),
                None,
                Some(SYSTEM_RESOLVER.to_string()),
                Some(now),
            ),
            Resolution::Escalated { reason } => {
                (ConflictStatus::Open, None, Some(reason.clone()), None, None)
            }
        };

        let conflict_id = Uuid::new_v4();
        self.conflicts
            .insert(sync_conflict::ActiveModel {
                id: Set(conflict_id),
                job_id: Set(detected.job_id),
                connection_id: Set(connection.id),
                provider_slug: Set(connection.provider_slug.clone()),
                resource_type: Set(detected.resource_type.to_string()),
                resource_id: Set(detected.resource_id.to_string()),
                local_value: Set(detected.local.data.clone()),
                remote_value: Set(detected.remote.data.clone()),
                local_modified_at: Set(detected.local.modified_at.map(|at| at.fixed_offset())),
                remote_modified_at: Set(detected.remote.modified_at.map(|at| at.fixed_offset())),
                status: Set(status),
                strategy: Set(strategy),
                outcome: Set(outcome),
                escalation_reason: Set(escalation_reason),
                resolved_by: Set(resolved_by),
                reason: Set(None),
                detected_at: Set(now),
                resolved_at: Set(resolved_at),
                propagated_at: Set(None),
                propagation_error: Set(None),
            })
            .await?;

        counter!(
            "conflicts_detected_total",
            "strategy" => format!("{strategy:?}"),
            "status" => if status == ConflictStatus::Open { "open" } else { "auto_resolved" }
        )
        .increment(1);
        tracing::info!(
            conflict_id = %conflict_id,
            connection_id = %connection.id,
            resource = %format!("{}/{}", detected.resource_type, detected.resource_id),
            ?strategy,
            ?status,
            "Conflict detected"
        );

        self.emit(SyncEvent::ConflictDetected {
            conflict_id,
            job_id: detected.job_id,
            connection_id: connection.id,
            provider_slug: connection.provider_slug.clone(),
            resource_type: detected.resource_type.to_string(),
            resource_id: detected.resource_id.to_string(),
            strategy,
            status,
        })
        .await;

        Ok(ConflictDecision {
            conflict_id,
            strategy,
            resolution,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<ConflictModel, ConflictError> {
        self.conflicts
            .find_by_id(id)
            .await?
            .ok_or(ConflictError::NotFound(id))
    }

    pub async fn list(&self, filter: ConflictFilter) -> Result<Vec<ConflictModel>, ConflictError> {
        Ok(self.conflicts.list(filter).await?)
    }

    /// Applies an operator decision to an OPEN conflict. Already settled
    /// conflicts return their existing outcome untouched.
    pub async fn resolve_conflict(
        &self,
        id: Uuid,
        decision: ManualDecision,
        reason: Option<String>,
        resolved_by: &str,
    ) -> Result<ResolvedConflict, ConflictError> {
        let conflict = self.get(id).await?;
        if conflict.status != ConflictStatus::Open {
            return Ok(Self::prior_outcome(conflict));
        }

        let local = VersionedRecord {
            data: conflict.local_value.clone(),
            modified_at: conflict.local_modified_at.map(|at| at.with_timezone(&Utc)),
        };
        let remote = VersionedRecord {
            data: conflict.remote_value.clone(),
            modified_at: conflict.remote_modified_at.map(|at| at.with_timezone(&Utc)),
        };

        let settled = match decision {
            ManualDecision::Ignore => None,
            ManualDecision::KeepLocal => Some((Winner::Local, local.data.clone())),
            ManualDecision::KeepRemote => Some((Winner::Remote, remote.data.clone())),
            strategy_decision => {
                match resolve(
                    strategy_decision.strategy(),
                    self.policy.source_priority(),
                    &local,
                    &remote,
                ) {
                    Resolution::Resolved { winner, record } => Some((winner, record)),
                    Resolution::Escalated { reason } => {
                        return Err(ConflictError::Validation(format!(
                            "{reason}; choose KEEP_LOCAL, KEEP_REMOTE or IGNORE"
                        )));
                    }
                }
            }
        };

        let (status, outcome) = match &settled {
            Some((winner, record)) => (
                ConflictStatus::Resolved,
                Some(outcome_json(*winner, record, Some(decision))),
            ),
            None => (ConflictStatus::Ignored, None),
        };

        let claimed = self
            .conflicts
            .claim_resolution(
                id,
                ConflictResolution {
                    status,
                    strategy: decision.strategy(),
                    outcome,
                    resolved_by: resolved_by.to_string(),
                    reason,
                },
            )
            .await?;
        if !claimed {
            // Another operator settled it between our read and write.
            return Ok(Self::prior_outcome(self.get(id).await?));
        }

        if let Some((_, record)) = &settled {
            let key = RecordKey::new(
                conflict.connection_id,
                conflict.resource_type.clone(),
                conflict.resource_id.clone(),
            );
            if let Err(error) = self.store.put(&key, record.clone(), Some(Utc::now())).await {
                tracing::error!(conflict_id = %id, error = %error, "Reopening conflict after store failure");
                self.conflicts.reopen(id).await?;
                return Err(ConflictError::Store(error.to_string()));
            }
        }

        let propagation_job_id = match &settled {
            Some((winner, _)) if decision.needs_propagation(*winner) => {
                self.enqueue_propagation(&conflict).await?
            }
            _ => None,
        };

        let resolved = self.get(id).await?;
        tracing::info!(
            conflict_id = %id,
            ?decision,
            resolved_by,
            propagation_job_id = ?propagation_job_id,
            "Conflict resolved manually"
        );
        self.emit(SyncEvent::ConflictResolved {
            conflict_id: id,
            connection_id: resolved.connection_id,
            provider_slug: resolved.provider_slug.clone(),
            status: resolved.status,
            resolved_by: resolved_by.to_string(),
        })
        .await;

        Ok(ResolvedConflict {
            record: settled.map(|(_, record)| record),
            conflict: resolved,
            already_resolved: false,
            propagation_job_id,
        })
    }

    async fn emit(&self, event: SyncEvent) {
        self.statistics.record_or_log(&event).await;
        self.events.publish(event);
    }

    fn prior_outcome(conflict: ConflictModel) -> ResolvedConflict {
        ResolvedConflict {
            record: outcome_record(&conflict),
            conflict,
            already_resolved: true,
            propagation_job_id: None,
        }
    }

    async fn enqueue_propagation(
        &self,
        conflict: &ConflictModel,
    ) -> Result<Option<String>, ConflictError> {
        let Some(connection) = self
            .directory
            .get_active_connection(conflict.connection_id)
            .await?
        else {
            tracing::warn!(
                conflict_id = %conflict.id,
                connection_id = %conflict.connection_id,
                "Connection inactive; resolved record not propagated"
            );
            return Ok(None);
        };
        if !connection.sync_direction.includes_outbound() {
            return Ok(None);
        }

        let job_id = format!("conflict-propagate-{}", conflict.id);
        match self
            .queues
            .conflicts
            .enqueue(
                ConflictTask::Propagate {
                    conflict_id: conflict.id,
                },
                JobOptions::new()
                    .job_id(job_id.clone())
                    .priority(PROPAGATION_PRIORITY),
            )
            .await
        {
            Ok(id) => Ok(Some(id)),
            Err(QueueError::DuplicateJob { .. }) => Ok(Some(job_id)),
            Err(error) => Err(error.into()),
        }
    }

    /// Pushes a manually resolved record to the provider, at most once per conflict.
    pub async fn propagate(&self, conflict_id: Uuid) -> Result<PropagationOutcome, SyncFailure> {
        let conflict = self.conflicts.find_by_id(conflict_id).await?.ok_or_else(|| {
            SyncFailure::fatal(
                FailureKind::Validation,
                format!("conflict {conflict_id} not found"),
            )
        })?;

        if conflict.propagated_at.is_some() {
            return Ok(PropagationOutcome::AlreadyPropagated);
        }
        let record = match (conflict.status, outcome_record(&conflict)) {
            (ConflictStatus::Resolved, Some(record))
                if outcome_winner(&conflict) != Some(Winner::Remote) =>
            {
                record
            }
            _ => return Ok(PropagationOutcome::Skipped),
        };

        let connection = self
            .directory
            .get_active_connection(conflict.connection_id)
            .await?
            .ok_or_else(|| {
                SyncFailure::fatal(
                    FailureKind::Validation,
                    format!("connection {} is not active", conflict.connection_id),
                )
            })?;
        let adapter = self.adapters.get(&connection.provider_slug).ok_or_else(|| {
            SyncFailure::fatal(
                FailureKind::Validation,
                format!("no adapter registered for {}", connection.provider_slug),
            )
        })?;

        let reference = format!("{}/{}", conflict.resource_type, conflict.resource_id);
        let rules = self
            .pipeline
            .load(&connection.provider_slug, &conflict.resource_type)
            .await?;
        let payload = rules
            .apply(&record, PipelineDirection::Outbound)
            .map_err(|e| SyncFailure::from(e).with_resource(reference.clone()))?;

        let provider_record = ProviderRecord {
            resource_type: conflict.resource_type.clone(),
            resource_id: conflict.resource_id.clone(),
            data: payload,
            modified_at: Some(Utc::now()),
        };
        tokio::time::timeout(
            self.adapter_timeout,
            adapter.push(&connection, &provider_record),
        )
        .await
        .map_err(|_| {
            SyncFailure::timeout(format!(
                "push of {reference} exceeded {}s",
                self.adapter_timeout.as_secs()
            ))
        })?
        .map_err(|e| e.into_failure().with_resource(reference.clone()))?;

        self.conflicts.mark_propagated(conflict_id).await?;
        tracing::info!(conflict_id = %conflict_id, resource = %reference, "Resolved record propagated");
        Ok(PropagationOutcome::Pushed)
    }

    /// Records a propagation the queue will not retry: on the conflict row,
    /// as a record-scoped error of the job that detected it, and as an
    /// operator alert once retries are exhausted.
    pub async fn propagation_abandoned(
        &self,
        conflict_id: Uuid,
        failure: &SyncFailure,
        attempt: u32,
    ) {
        let message = format!("{}: {}", failure.code(), failure.message);
        if let Err(error) = self
            .conflicts
            .mark_propagation_failed(conflict_id, &message)
            .await
        {
            tracing::error!(conflict_id = %conflict_id, error = %error, "Failed to record propagation failure");
        }

        let conflict = match self.conflicts.find_by_id(conflict_id).await {
            Ok(Some(conflict)) => conflict,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(conflict_id = %conflict_id, error = %error, "Failed to load conflict");
                return;
            }
        };
        let reference = format!("{}/{}", conflict.resource_type, conflict.resource_id);

        if let Some(job_id) = conflict.job_id
            && let Err(error) = self
                .errors
                .record(NewSyncError {
                    job_id,
                    kind: failure.kind,
                    severity: ErrorSeverity::Error,
                    message: format!(
                        "propagation of conflict {conflict_id} abandoned: {}",
                        failure.message
                    ),
                    resource_ref: Some(
                        failure
                            .resource_ref
                            .clone()
                            .unwrap_or_else(|| reference.clone()),
                    ),
                    context: Some(failure.to_json()),
                    terminal: false,
                })
                .await
        {
            tracing::error!(
                conflict_id = %conflict_id,
                job_id = %job_id,
                error = %error,
                "Failed to record propagation error"
            );
        }

        counter!("conflict_propagations_failed_total").increment(1);
        tracing::error!(
            conflict_id = %conflict_id,
            resource = %reference,
            attempt,
            code = failure.code(),
            error = %failure.message,
            "Conflict propagation abandoned"
        );
        if failure.retryable {
            self.notifier
                .notify(CriticalAlert {
                    severity: ErrorSeverity::Critical,
                    code: failure.code().to_string(),
                    message: format!(
                        "propagation of {reference} failed after {attempt} attempts: {}",
                        failure.message
                    ),
                    job_id: conflict.job_id,
                    connection_id: Some(conflict.connection_id),
                    webhook_config_id: None,
                })
                .await;
        }
    }
}
