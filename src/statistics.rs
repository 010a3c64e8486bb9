//! # Sync statistics
//!
//! Daily counters per (day, provider, connection). The orchestrator and the
//! conflict service apply each lifecycle event before publishing it, so a job
//! that finishes while the engine drains still counts. Read back by
//! `GET /sync/statistics`.

use chrono::{Days, NaiveDate, Utc};
use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::events::SyncEvent;
use crate::models::enums::ConflictStatus;
use crate::models::sync_job::JobSummary;
use crate::models::sync_statistics::Model as StatisticsRowModel;
use crate::repositories::sync_statistics::{StatisticsDelta, SyncStatisticsRepository};

pub const DEFAULT_RANGE: &str = "7d";
const MAX_RANGE_DAYS: u64 = 365;

#[derive(Debug, Error)]
pub enum StatisticsError {
    #[error("invalid range '{0}': expected Nd (1-365) or Nh")]
    InvalidRange(String),
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Parses `Nd` or `Nh` into a whole number of days; hours round up.
pub fn parse_range(raw: &str) -> Result<u64, StatisticsError> {
    let trimmed = raw.trim();
    let invalid = || StatisticsError::InvalidRange(raw.to_string());

    let Some((unit_at, _)) = trimmed.char_indices().last() else {
        return Err(invalid());
    };
    let (amount, unit) = trimmed.split_at(unit_at);
    let amount: u64 = amount.parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }

    let days = match unit {
        "d" | "D" => amount,
        "h" | "H" => amount.div_ceil(24),
        _ => return Err(invalid()),
    };
    if days > MAX_RANGE_DAYS {
        return Err(invalid());
    }
    Ok(days)
}

/// Counters one event contributes, or `None` when it does not count.
pub fn delta_for(event: &SyncEvent) -> Option<StatisticsDelta> {
    match event {
        SyncEvent::JobCompleted {
            summary,
            duration_ms,
            ..
        } => Some(StatisticsDelta {
            jobs_completed: 1,
            ..job_delta(summary, *duration_ms)
        }),
        SyncEvent::JobFailed {
            summary,
            duration_ms,
            ..
        } => Some(StatisticsDelta {
            jobs_failed: 1,
            ..job_delta(summary, *duration_ms)
        }),
        // In-job conflicts arrive through the job summary.
        SyncEvent::ConflictDetected {
            job_id: None,
            status,
            ..
        } => Some(StatisticsDelta {
            conflicts_detected: 1,
            conflicts_resolved: i64::from(*status == ConflictStatus::AutoResolved),
            ..StatisticsDelta::default()
        }),
        SyncEvent::ConflictDetected { .. } => None,
        SyncEvent::ConflictResolved { .. } => Some(StatisticsDelta {
            conflicts_resolved: 1,
            ..StatisticsDelta::default()
        }),
        SyncEvent::WebhookRejected { .. } => None,
    }
}

fn job_delta(summary: &JobSummary, duration_ms: u64) -> StatisticsDelta {
    StatisticsDelta {
        records_processed: i64::from(summary.records_processed),
        records_transformed: i64::from(summary.records_stored) + i64::from(summary.records_pushed),
        records_failed: i64::from(summary.records_failed),
        conflicts_detected: i64::from(summary.conflicts_detected),
        conflicts_resolved: i64::from(summary.conflicts_resolved),
        bytes_transferred: summary.bytes_transferred,
        total_duration_ms: i64::try_from(duration_ms).unwrap_or(i64::MAX),
        ..StatisticsDelta::default()
    }
}

fn event_day(event: &SyncEvent) -> NaiveDate {
    match event {
        SyncEvent::JobCompleted { completed_at, .. } => completed_at.date_naive(),
        SyncEvent::JobFailed { failed_at, .. } => failed_at.date_naive(),
        _ => Utc::now().date_naive(),
    }
}

fn provider_of(event: &SyncEvent) -> Option<&str> {
    match event {
        SyncEvent::JobCompleted { provider_slug, .. }
        | SyncEvent::JobFailed { provider_slug, .. }
        | SyncEvent::ConflictDetected { provider_slug, .. }
        | SyncEvent::ConflictResolved { provider_slug, .. } => Some(provider_slug),
        SyncEvent::WebhookRejected { .. } => None,
    }
}

/// Counter values shared by per-day rows and totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsCounters {
    pub jobs_completed: i64,
    pub jobs_failed: i64,
    pub records_processed: i64,
    pub records_transformed: i64,
    pub records_failed: i64,
    pub conflicts_detected: i64,
    pub conflicts_resolved: i64,
    pub bytes_transferred: i64,
    pub total_duration_ms: i64,
}

impl StatisticsCounters {
    fn add(&mut self, other: &StatisticsCounters) {
        self.jobs_completed += other.jobs_completed;
        self.jobs_failed += other.jobs_failed;
        self.records_processed += other.records_processed;
        self.records_transformed += other.records_transformed;
        self.records_failed += other.records_failed;
        self.conflicts_detected += other.conflicts_detected;
        self.conflicts_resolved += other.conflicts_resolved;
        self.bytes_transferred += other.bytes_transferred;
        self.total_duration_ms += other.total_duration_ms;
    }
}

impl From<&StatisticsRowModel> for StatisticsCounters {
    fn from(row: &StatisticsRowModel) -> Self {
        Self {
            jobs_completed: row.jobs_completed,
            jobs_failed: row.jobs_failed,
            records_processed: row.records_processed,
            records_transformed: row.records_transformed,
            records_failed: row.records_failed,
            conflicts_detected: row.conflicts_detected,
            conflicts_resolved: row.conflicts_resolved,
            bytes_transferred: row.bytes_transferred,
            total_duration_ms: row.total_duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatistics {
    pub day: NaiveDate,
    pub provider_slug: String,
    pub connection_id: Uuid,
    #[serde(flatten)]
    pub counters: StatisticsCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsTotals {
    #[serde(flatten)]
    pub counters: StatisticsCounters,
    /// Mean duration of finished jobs, absent when none finished
    pub average_job_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsReport {
    pub range: String,
    pub since: NaiveDate,
    pub connection_id: Option<Uuid>,
    pub days: Vec<DailyStatistics>,
    pub totals: StatisticsTotals,
}

pub fn summarize(
    range: &str,
    since: NaiveDate,
    connection_id: Option<Uuid>,
    rows: &[StatisticsRowModel],
) -> StatisticsReport {
    let mut counters = StatisticsCounters::default();
    let days = rows
        .iter()
        .map(|row| {
            let row_counters = StatisticsCounters::from(row);
            counters.add(&row_counters);
            DailyStatistics {
                day: row.day,
                provider_slug: row.provider_slug.clone(),
                connection_id: row.connection_id,
                counters: row_counters,
            }
        })
        .collect();

    let finished = counters.jobs_completed + counters.jobs_failed;
    let average_job_duration_ms =
        (finished > 0).then(|| counters.total_duration_ms as f64 / finished as f64);

    StatisticsReport {
        range: range.to_string(),
        since,
        connection_id,
        days,
        totals: StatisticsTotals {
            counters,
            average_job_duration_ms,
        },
    }
}

#[derive(Debug, Clone)]
pub struct StatisticsService {
    repository: SyncStatisticsRepository,
}

impl StatisticsService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            repository: SyncStatisticsRepository::new(db),
        }
    }

    /// Adds the event's counters to its day's row; events that do not count are ignored.
    pub async fn record(&self, event: &SyncEvent) -> Result<(), StatisticsError> {
        let (Some(delta), Some(provider_slug)) = (delta_for(event), provider_of(event)) else {
            return Ok(());
        };
        self.repository
            .increment(event_day(event), provider_slug, event.connection_id(), delta)
            .await?;
        Ok(())
    }

    /// Like [`record`](Self::record), but a failed write is logged rather than
    /// surfaced; the caller's own outcome is already durable.
    pub async fn record_or_log(&self, event: &SyncEvent) {
        if let Err(err) = self.record(event).await {
            tracing::error!(
                event_type = event.event_type(),
                connection_id = %event.connection_id(),
                error = %err,
                "Failed to record statistics"
            );
        }
    }

    pub async fn query(
        &self,
        connection_id: Option<Uuid>,
        range: Option<&str>,
    ) -> Result<StatisticsReport, StatisticsError> {
        let range = range.filter(|r| !r.trim().is_empty()).unwrap_or(DEFAULT_RANGE);
        let days = parse_range(range)?;
        let today = Utc::now().date_naive();
        let since = today
            .checked_sub_days(Days::new(days - 1))
            .unwrap_or(NaiveDate::MIN);

        let rows = self.repository.list_since(since, connection_id).await?;
        Ok(summarize(range.trim(), since, connection_id, &rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncFailure;
    use crate::models::enums::{ConflictStrategy, FailureKind};

    fn summary() -> JobSummary {
        JobSummary {
            records_processed: 3,
            records_stored: 2,
            records_pushed: 1,
            records_failed: 0,
            conflicts_detected: 1,
            conflicts_resolved: 1,
            bytes_transferred: 2048,
        }
    }

    #[test]
    fn range_accepts_days_and_rounds_hours_up() {
        assert_eq!(parse_range("7d").unwrap(), 7);
        assert_eq!(parse_range("365d").unwrap(), 365);
        assert_eq!(parse_range("24h").unwrap(), 1);
        assert_eq!(parse_range("25h").unwrap(), 2);
        assert_eq!(parse_range(" 1h ").unwrap(), 1);
    }

    #[test]
    fn range_rejects_out_of_bounds_and_garbage() {
        for raw in ["0d", "366d", "9000h", "7", "d", "7w", "-1d", ""] {
            assert!(
                matches!(parse_range(raw), Err(StatisticsError::InvalidRange(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn completed_job_counts_summary_and_duration() {
        let event = SyncEvent::JobCompleted {
            job_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            provider_slug: "epic".to_string(),
            attempt: 1,
            summary: summary(),
            duration_ms: 1500,
            completed_at: Utc::now(),
        };

        let delta = delta_for(&event).unwrap();
        assert_eq!(delta.jobs_completed, 1);
        assert_eq!(delta.jobs_failed, 0);
        assert_eq!(delta.records_processed, 3);
        assert_eq!(delta.records_transformed, 3);
        assert_eq!(delta.conflicts_detected, 1);
        assert_eq!(delta.bytes_transferred, 2048);
        assert_eq!(delta.total_duration_ms, 1500);
    }

    #[test]
    fn failed_job_counts_as_failure() {
        let event = SyncEvent::JobFailed {
            job_id: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            provider_slug: "cerner".to_string(),
            attempt: 3,
            failure: SyncFailure::new(FailureKind::Connection, "connection refused"),
            summary: JobSummary::default(),
            duration_ms: 20,
            failed_at: Utc::now(),
        };

        let delta = delta_for(&event).unwrap();
        assert_eq!(delta.jobs_failed, 1);
        assert_eq!(delta.jobs_completed, 0);
        assert_eq!(delta.total_duration_ms, 20);
    }

    #[test]
    fn only_conflicts_outside_jobs_count_directly() {
        let detected = |job_id: Option<Uuid>, status| SyncEvent::ConflictDetected {
            conflict_id: Uuid::new_v4(),
            job_id,
            connection_id: Uuid::new_v4(),
            provider_slug: "epic".to_string(),
            resource_type: "Patient".to_string(),
            resource_id: "p-1".to_string(),
            strategy: ConflictStrategy::LastWriteWins,
            status,
        };

        assert!(delta_for(&detected(Some(Uuid::new_v4()), ConflictStatus::Open)).is_none());

        let delta = delta_for(&detected(None, ConflictStatus::AutoResolved)).unwrap();
        assert_eq!(delta.conflicts_detected, 1);
        assert_eq!(delta.conflicts_resolved, 1);

        let delta = delta_for(&detected(None, ConflictStatus::Open)).unwrap();
        assert_eq!(delta.conflicts_resolved, 0);
    }

    #[test]
    fn summarize_totals_rows() {
        let connection_id = Uuid::new_v4();
        let row = |day: u32, completed: i64, failed: i64, duration: i64| StatisticsRowModel {
            id: Uuid::new_v4(),
            day: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
            provider_slug: "epic".to_string(),
            connection_id,
            jobs_completed: completed,
            jobs_failed: failed,
            records_processed: 10,
            records_transformed: 8,
            records_failed: 2,
            conflicts_detected: 1,
            conflicts_resolved: 1,
            bytes_transferred: 100,
            total_duration_ms: duration,
            updated_at: Utc::now().fixed_offset(),
        };
        let since = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        let report = summarize("7d", since, Some(connection_id), &[row(1, 2, 0, 300), row(2, 1, 1, 500)]);

        assert_eq!(report.days.len(), 2);
        assert_eq!(report.totals.counters.jobs_completed, 3);
        assert_eq!(report.totals.counters.jobs_failed, 1);
        assert_eq!(report.totals.counters.records_processed, 20);
        assert_eq!(report.totals.average_job_duration_ms, Some(200.0));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["totals"]["jobsCompleted"], 3);
        assert_eq!(json["days"][0]["day"], "2026-01-01");
    }

    #[test]
    fn summarize_without_jobs_has_no_average() {
        let report = summarize("1d", Utc::now().date_naive(), None, &[]);
        assert!(report.days.is_empty());
        assert_eq!(report.totals.average_job_duration_ms, None);
    }
}
