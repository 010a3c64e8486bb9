//! # Engine wiring
//!
//! Builds every service once, connects the four queues to their handlers and
//! owns the background tasks (webhook fan-out, scheduler, maintenance).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{AdapterError, AdapterRegistry};
use crate::collaborators::Collaborators;
use crate::config::AppConfig;
use crate::conflicts::ConflictService;
use crate::crypto::{CryptoError, CryptoKey};
use crate::error::SyncFailure;
use crate::events::EventBus;
use crate::maintenance;
use crate::orchestrator::{Orchestrator, OrchestratorError, ProcessOutcome};
use crate::queue::{
    ConflictTask, JobContext, JobFailure, JobHandler, JobQueues, SyncJobTask, TransformTask,
    WebhookTask,
};
use crate::scheduler::SyncScheduler;
use crate::statistics::StatisticsService;
use crate::webhooks::{self, WebhookService};

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("crypto key is not configured")]
    MissingCryptoKey,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("crash recovery failed: {0}")]
    Recovery(#[from] OrchestratorError),
}

/// The assembled sync engine.
pub struct Engine {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub queues: JobQueues,
    pub events: EventBus,
    pub adapters: Arc<AdapterRegistry>,
    pub collaborators: Collaborators,
    pub orchestrator: Arc<Orchestrator>,
    pub conflicts: Arc<ConflictService>,
    pub webhooks: Arc<WebhookService>,
    pub statistics: Arc<StatisticsService>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Database-backed collaborators and the FHIR adapters for every vendor.
    pub fn new(config: AppConfig, db: DatabaseConnection) -> Result<Self, EngineError> {
        let adapters = AdapterRegistry::from_config(&config.providers)?;
        let collaborators = Collaborators::database(&db);
        Self::with_parts(config, db, collaborators, adapters)
    }

    pub fn with_parts(
        config: AppConfig,
        db: DatabaseConnection,
        collaborators: Collaborators,
        adapters: AdapterRegistry,
    ) -> Result<Self, EngineError> {
        let crypto_key = CryptoKey::new(
            config
                .crypto_key
                .clone()
                .ok_or(EngineError::MissingCryptoKey)?,
        )?;
        let adapters = Arc::new(adapters);
        let queues = JobQueues::from_config(&config.queues);
        let events = EventBus::new();
        let statistics = Arc::new(StatisticsService::new(db.clone()));

        let conflicts = Arc::new(ConflictService::new(
            db.clone(),
            &config,
            Arc::clone(&collaborators.store),
            Arc::clone(&collaborators.directory),
            Arc::clone(&collaborators.notifier),
            Arc::clone(&adapters),
            queues.clone(),
            events.clone(),
            Arc::clone(&statistics),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            &config,
            collaborators.clone(),
            Arc::clone(&adapters),
            Arc::clone(&conflicts),
            queues.clone(),
            events.clone(),
            Arc::clone(&statistics),
        ));
        let webhooks = Arc::new(WebhookService::new(
            db.clone(),
            config.webhooks.clone(),
            crypto_key,
            collaborators.clone(),
            Arc::clone(&adapters),
            Arc::clone(&orchestrator),
            queues.clone(),
            events.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            queues,
            events,
            adapters,
            collaborators,
            orchestrator,
            conflicts,
            webhooks,
            statistics,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts queue dispatchers and background tasks, then re-enqueues work a
    /// previous process left behind.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut tasks = self.tasks.lock().await;

        tasks.push(self.queues.sync_jobs.start(Arc::new(SyncJobHandler {
            orchestrator: Arc::clone(&self.orchestrator),
        })));
        tasks.push(self.queues.webhooks.start(Arc::new(WebhookHandler {
            webhooks: Arc::clone(&self.webhooks),
        })));
        tasks.push(self.queues.conflicts.start(Arc::new(ConflictHandler {
            conflicts: Arc::clone(&self.conflicts),
        })));
        tasks.push(self.queues.transformations.start(Arc::new(TransformHandler {
            orchestrator: Arc::clone(&self.orchestrator),
            webhooks: Arc::clone(&self.webhooks),
        })));

        tasks.push(webhooks::spawn_fan_out(
            Arc::clone(&self.webhooks),
            self.events.subscribe(),
            self.shutdown.clone(),
        ));

        if self.config.scheduler.enabled {
            let scheduler = SyncScheduler::new(
                self.db.clone(),
                self.config.scheduler.clone(),
                Arc::clone(&self.orchestrator),
            );
            tasks.push(tokio::spawn(scheduler.run(self.shutdown.clone())));
        } else {
            tracing::info!("Sync scheduler disabled");
        }

        tasks.push(maintenance::spawn(
            Arc::clone(&self.orchestrator),
            Duration::from_secs(self.config.orchestrator.maintenance_interval_seconds),
            self.shutdown.clone(),
        ));
        drop(tasks);

        let recovered = self.orchestrator.recover_pending().await?;
        tracing::info!(recovered, "Sync engine started");
        Ok(())
    }

    /// Stops background tasks, drains the queues and waits for dispatchers.
    /// Jobs finishing during the grace period still write their statistics,
    /// since workers record them before publishing.
    pub async fn shutdown(&self) {
        self.shutdown_with_grace(DEFAULT_SHUTDOWN_GRACE).await;
    }

    pub async fn shutdown_with_grace(&self, grace: Duration) {
        tracing::info!(grace_ms = grace.as_millis() as u64, "Sync engine shutting down");
        self.shutdown.cancel();
        self.queues.shutdown(grace).await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Background task ended abnormally");
            }
        }
        tracing::info!("Sync engine stopped");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// True when the queue will not run this task again after `failure`.
fn gives_up(ctx: &JobContext, failure: &SyncFailure) -> bool {
    !failure.retryable || ctx.is_final_attempt()
}

/// Maps a classified failure onto the queue's retry decision.
pub fn queue_failure(failure: SyncFailure) -> JobFailure {
    if failure.retryable {
        JobFailure::Retry(failure.to_string())
    } else {
        JobFailure::Fatal(failure.to_string())
    }
}

struct SyncJobHandler {
    orchestrator: Arc<Orchestrator>,
}

#[async_trait]
impl JobHandler<SyncJobTask> for SyncJobHandler {
    async fn handle(&self, ctx: JobContext, task: SyncJobTask) -> Result<(), JobFailure> {
        match self.orchestrator.process_job(task.job_id, &ctx.cancel).await? {
            ProcessOutcome::Cancelled => Err(JobFailure::Cancelled),
            ProcessOutcome::Skipped | ProcessOutcome::Completed(_) => Ok(()),
        }
    }
}

struct WebhookHandler {
    webhooks: Arc<WebhookService>,
}

#[async_trait]
impl JobHandler<WebhookTask> for WebhookHandler {
    async fn handle(&self, ctx: JobContext, task: WebhookTask) -> Result<(), JobFailure> {
        match task {
            WebhookTask::Process {
                log_id,
                config_id,
                payload_hash,
                event,
            } => self
                .webhooks
                .process_event(log_id, config_id, &payload_hash, event, ctx.attempt)
                .await
                .map(|_| ())
                .map_err(queue_failure),
            WebhookTask::Deliver {
                config_id,
                delivery_id,
                event_type,
                payload,
            } => self
                .webhooks
                .deliver(config_id, delivery_id, &event_type, &payload, ctx.attempt)
                .await
                .map_err(queue_failure),
        }
    }
}

struct ConflictHandler {
    conflicts: Arc<ConflictService>,
}

#[async_trait]
impl JobHandler<ConflictTask> for ConflictHandler {
    async fn handle(&self, ctx: JobContext, task: ConflictTask) -> Result<(), JobFailure> {
        match task {
            ConflictTask::Propagate { conflict_id } => {
                match self.conflicts.propagate(conflict_id).await {
                    Ok(_) => Ok(()),
                    Err(failure) => {
                        if gives_up(&ctx, &failure) {
                            self.conflicts
                                .propagation_abandoned(conflict_id, &failure, ctx.attempt)
                                .await;
                        }
                        Err(queue_failure(failure))
                    }
                }
            }
        }
    }
}

struct TransformHandler {
    orchestrator: Arc<Orchestrator>,
    webhooks: Arc<WebhookService>,
}

#[async_trait]
impl JobHandler<TransformTask> for TransformHandler {
    async fn handle(&self, ctx: JobContext, task: TransformTask) -> Result<(), JobFailure> {
        match self.orchestrator.ingest_task(task.clone()).await {
            Ok(_) => Ok(()),
            Err(failure) => {
                if gives_up(&ctx, &failure) {
                    self.webhooks
                        .record_transform_failure(&task, &failure, &ctx.job_id, ctx.attempt)
                        .await;
                }
                Err(queue_failure(failure))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::enums::FailureKind;

    #[test]
    fn retryable_failures_are_retried() {
        assert_eq!(
            queue_failure(SyncFailure::timeout("adapter timed out")),
            JobFailure::Retry("adapter timed out".to_string())
        );
        assert_eq!(
            queue_failure(SyncFailure::new(FailureKind::Validation, "bad payload")),
            JobFailure::Fatal("bad payload".to_string())
        );
    }

    #[test]
    fn queue_gives_up_on_fatal_failures_and_the_last_attempt() {
        let ctx = |attempt| JobContext {
            queue: "transformations",
            job_id: "transform-1".to_string(),
            attempt,
            max_attempts: 3,
            cancel: CancellationToken::new(),
        };
        let transient = SyncFailure::timeout("slow store");
        let fatal = SyncFailure::new(FailureKind::Validation, "bad payload");

        assert!(!gives_up(&ctx(1), &transient));
        assert!(gives_up(&ctx(3), &transient));
        assert!(gives_up(&ctx(1), &fatal));
    }
}
