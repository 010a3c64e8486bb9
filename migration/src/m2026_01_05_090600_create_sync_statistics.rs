//! Migration to create the sync_statistics table.
//!
//! Counters are keyed by (day, provider_slug, connection_id); the unique index
//! backs the atomic upsert used by the statistics recorder.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

const UNIQUE_KEY_INDEX: &str = "uq_sync_statistics_day_provider_connection";

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncStatistics::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncStatistics::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncStatistics::Day).date().not_null())
                    .col(ColumnDef::new(SyncStatistics::ProviderSlug).text().not_null())
                    .col(ColumnDef::new(SyncStatistics::ConnectionId).uuid().not_null())
                    .col(counter(SyncStatistics::JobsCompleted))
                    .col(counter(SyncStatistics::JobsFailed))
                    .col(counter(SyncStatistics::RecordsProcessed))
                    .col(counter(SyncStatistics::RecordsTransformed))
                    .col(counter(SyncStatistics::RecordsFailed))
                    .col(counter(SyncStatistics::ConflictsDetected))
                    .col(counter(SyncStatistics::ConflictsResolved))
                    .col(counter(SyncStatistics::BytesTransferred))
                    .col(counter(SyncStatistics::TotalDurationMs))
                    .col(
                        ColumnDef::new(SyncStatistics::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name(UNIQUE_KEY_INDEX)
                    .table(SyncStatistics::Table)
                    .col(SyncStatistics::Day)
                    .col(SyncStatistics::ProviderSlug)
                    .col(SyncStatistics::ConnectionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name(UNIQUE_KEY_INDEX).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncStatistics::Table).to_owned())
            .await
    }
}

fn counter(column: SyncStatistics) -> ColumnDef {
    ColumnDef::new(column)
        .big_integer()
        .not_null()
        .default(0)
        .to_owned()
}

#[derive(DeriveIden)]
enum SyncStatistics {
    Table,
    Id,
    Day,
    ProviderSlug,
    ConnectionId,
    JobsCompleted,
    JobsFailed,
    RecordsProcessed,
    RecordsTransformed,
    RecordsFailed,
    ConflictsDetected,
    ConflictsResolved,
    BytesTransferred,
    TotalDurationMs,
    UpdatedAt,
}
