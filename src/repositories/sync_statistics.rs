//! # Sync statistics repository
//!
//! Daily counters keyed by (day, provider, connection). Increments are a single
//! `INSERT ... ON CONFLICT DO UPDATE SET col = col + delta` so concurrent
//! recorders never lose updates.

use chrono::Utc;
use sea_orm::prelude::Date;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::{Expr, OnConflict},
};
use uuid::Uuid;

use crate::models::sync_statistics::{ActiveModel, Column, Entity, Model};

/// Amounts to add to one day's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsDelta {
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

#[derive(Debug, Clone)]
pub struct SyncStatisticsRepository {
    db: DatabaseConnection,
}

impl SyncStatisticsRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn increment(
        &self,
        day: Date,
        provider_slug: &str,
        connection_id: Uuid,
        delta: StatisticsDelta,
    ) -> Result<(), DbErr> {
        let now = Utc::now().fixed_offset();
        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            day: Set(day),
            provider_slug: Set(provider_slug.to_string()),
            connection_id: Set(connection_id),
            jobs_completed: Set(delta.jobs_completed),
            jobs_failed: Set(delta.jobs_failed),
            records_processed: Set(delta.records_processed),
            records_transformed: Set(delta.records_transformed),
            records_failed: Set(delta.records_failed),
            conflicts_detected: Set(delta.conflicts_detected),
            conflicts_resolved: Set(delta.conflicts_resolved),
            bytes_transferred: Set(delta.bytes_transferred),
            total_duration_ms: Set(delta.total_duration_ms),
            updated_at: Set(now),
        };

        let counters = [
            (Column::JobsCompleted, delta.jobs_completed),
            (Column::JobsFailed, delta.jobs_failed),
            (Column::RecordsProcessed, delta.records_processed),
            (Column::RecordsTransformed, delta.records_transformed),
            (Column::RecordsFailed, delta.records_failed),
            (Column::ConflictsDetected, delta.conflicts_detected),
            (Column::ConflictsResolved, delta.conflicts_resolved),
            (Column::BytesTransferred, delta.bytes_transferred),
            (Column::TotalDurationMs, delta.total_duration_ms),
        ];

        let mut on_conflict =
            OnConflict::columns([Column::Day, Column::ProviderSlug, Column::ConnectionId]);
        for (column, amount) in counters {
            on_conflict.value(column, Expr::col((Entity, column)).add(amount));
        }
        on_conflict.value(Column::UpdatedAt, Expr::value(now));

        Entity::insert(row)
            .on_conflict(on_conflict.to_owned())
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    /// Rows with `day >= since`, optionally restricted to one connection, oldest first.
    pub async fn list_since(
        &self,
        since: Date,
        connection_id: Option<Uuid>,
    ) -> Result<Vec<Model>, DbErr> {
        let mut query = Entity::find()
            .filter(Column::Day.gte(since))
            .order_by_asc(Column::Day)
            .order_by_asc(Column::ProviderSlug);
        if let Some(connection_id) = connection_id {
            query = query.filter(Column::ConnectionId.eq(connection_id));
        }
        query.all(&self.db).await
    }
}
