//! Periodic housekeeping: retention purge and recovery of stalled attempts.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{Orchestrator, OrchestratorError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub jobs_purged: u64,
    pub jobs_requeued: usize,
}

/// One maintenance pass. Recovery is idempotent: jobs still waiting on the
/// queue are deduplicated by id.
pub async fn run_once(orchestrator: &Orchestrator) -> Result<MaintenanceReport, OrchestratorError> {
    let jobs_purged = orchestrator.purge_expired().await?;
    let jobs_requeued = orchestrator.recover_pending().await?;
    counter!("maintenance_jobs_purged_total").increment(jobs_purged);
    Ok(MaintenanceReport {
        jobs_purged,
        jobs_requeued,
    })
}

pub fn spawn(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_seconds = interval.as_secs(), "Maintenance task started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match run_once(&orchestrator).await {
                        Ok(report) => tracing::debug!(
                            purged = report.jobs_purged,
                            requeued = report.jobs_requeued,
                            "Maintenance pass finished"
                        ),
                        Err(err) => tracing::error!(error = %err, "Maintenance pass failed"),
                    }
                }
            }
        }
        tracing::info!("Maintenance task stopped");
    })
}
