//! # Sync Scheduler
//!
//! Background task that walks active connections each tick and creates an
//! INCREMENTAL job for every connection whose sync interval (plus jitter) has
//! elapsed since its last successful sync. Connections that already have a
//! job waiting or running are skipped, so each connection has at most one
//! scheduled job in flight.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use sea_orm::{DatabaseConnection, DbErr};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SchedulerConfig;
use crate::models::connection::Model as ConnectionModel;
use crate::models::enums::JobType;
use crate::orchestrator::{JobSpec, Orchestrator, OrchestratorError};
use crate::repositories::{ConnectionRepository, SyncJobRepository};

/// Scheduled work sits below operator-requested jobs.
pub const SCHEDULED_JOB_PRIORITY: u8 = 4;

pub struct SyncScheduler {
    connections: ConnectionRepository,
    jobs: SyncJobRepository,
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub connections_polled: u64,
    pub jobs_enqueued: u64,
    pub skipped_open_job: u64,
    pub skipped_not_due: u64,
    pub connections_with_errors: u64,
}

impl SyncScheduler {
    pub fn new(
        db: DatabaseConnection,
        config: SchedulerConfig,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            connections: ConnectionRepository::new(db.clone()),
            jobs: SyncJobRepository::new(db),
            orchestrator,
            config,
        }
    }

    /// Run the scheduler loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_seconds = self.config.tick_interval_seconds,
            "Starting sync scheduler"
        );
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, "Scheduler tick failed");
                    }
                    histogram!("sync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Evaluates every active connection once.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats, DbErr> {
        let mut stats = TickStats::default();

        for connection in self.connections.list_active().await? {
            stats.connections_polled += 1;
            if let Err(err) = self.process_connection(&connection, now, &mut stats).await {
                stats.connections_with_errors += 1;
                error!(
                    error = %err,
                    connection_id = %connection.id,
                    "Failed to schedule connection"
                );
            }
        }

        debug!(
            polled = stats.connections_polled,
            enqueued = stats.jobs_enqueued,
            skipped_open_job = stats.skipped_open_job,
            skipped_not_due = stats.skipped_not_due,
            errors = stats.connections_with_errors,
            "Scheduler tick completed"
        );
        Ok(stats)
    }

    async fn process_connection(
        &self,
        connection: &ConnectionModel,
        now: DateTime<Utc>,
        stats: &mut TickStats,
    ) -> Result<(), OrchestratorError> {
        let interval_seconds = interval_for(&self.config, connection);
        let jitter_seconds = sample_jitter_seconds(&self.config, interval_seconds);
        let last_synced = connection
            .last_synced_at
            .map(|at| at.with_timezone(&Utc));

        if !is_due(last_synced, interval_seconds, jitter_seconds, now) {
            stats.skipped_not_due += 1;
            return Ok(());
        }

        if self.jobs.has_open_job(connection.id).await? {
            stats.skipped_open_job += 1;
            debug!(connection_id = %connection.id, "Open job exists; skipping scheduled sync");
            return Ok(());
        }

        if connection.permitted_types().is_empty() {
            warn!(
                connection_id = %connection.id,
                "Connection has no permitted resource types; cannot schedule incremental sync"
            );
            return Ok(());
        }

        let job = self
            .orchestrator
            .create_job(JobSpec {
                connection_id: connection.id,
                job_type: JobType::Incremental,
                direction: connection.sync_direction,
                priority: Some(SCHEDULED_JOB_PRIORITY),
                resource_types: Vec::new(),
                since: None,
                patient_id: None,
                resource_id: None,
                max_attempts: None,
            })
            .await?;

        stats.jobs_enqueued += 1;
        counter!("sync_scheduler_jobs_enqueued_total", "provider" => connection.provider_slug.clone())
            .increment(1);
        info!(
            connection_id = %connection.id,
            job_id = %job.id,
            interval_seconds,
            jitter_seconds,
            "Scheduled incremental sync"
        );
        Ok(())
    }
}

fn interval_for(config: &SchedulerConfig, connection: &ConnectionModel) -> u64 {
    connection
        .sync_interval_seconds
        .and_then(|seconds| u64::try_from(seconds).ok())
        .filter(|seconds| *seconds > 0)
        .unwrap_or(config.default_interval_seconds)
}

/// A connection that never synced is due immediately.
fn is_due(
    last_synced: Option<DateTime<Utc>>,
    interval_seconds: u64,
    jitter_seconds: u64,
    now: DateTime<Utc>,
) -> bool {
    let Some(last_synced) = last_synced else {
        return true;
    };
    i64::try_from(interval_seconds.saturating_add(jitter_seconds))
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|wait| last_synced.checked_add_signed(wait))
        .is_some_and(|due_at| due_at <= now)
}

fn sample_jitter_seconds(config: &SchedulerConfig, base_interval_seconds: u64) -> u64 {
    let mut rng = rand::thread_rng();
    compute_jitter_seconds(config, base_interval_seconds, &mut rng)
}

fn compute_jitter_seconds<R: Rng + ?Sized>(
    config: &SchedulerConfig,
    base_interval_seconds: u64,
    rng: &mut R,
) -> u64 {
    let min = config.jitter_pct_min.max(0.0);
    let max = config.jitter_pct_max.max(min);

    if min == 0.0 && max == 0.0 {
        return 0;
    }

    let jitter_pct = if (max - min).abs() < f64::EPSILON {
        min
    } else {
        rng.gen_range(min..=max)
    };

    (base_interval_seconds as f64 * jitter_pct).round() as u64
}
