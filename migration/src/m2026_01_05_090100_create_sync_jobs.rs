//! Migration to create the sync_jobs table.
//!
//! One row per requested synchronization run, carrying its lifecycle status,
//! attempt budget and result summary.

use sea_orm_migration::prelude::*;

use crate::m2026_01_05_090000_create_connections::Connections;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobs::ProviderSlug).text().not_null())
                    .col(ColumnDef::new(SyncJobs::JobType).text().not_null())
                    .col(ColumnDef::new(SyncJobs::Direction).text().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::Priority)
                            .small_integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Status)
                            .text()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(ColumnDef::new(SyncJobs::PatientId).text().null())
                    .col(ColumnDef::new(SyncJobs::ResourceTypes).json_binary().not_null())
                    .col(ColumnDef::new(SyncJobs::ResourceId).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::Since)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::MaxAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(ColumnDef::new(SyncJobs::LastError).json_binary().null())
                    .col(
                        ColumnDef::new(SyncJobs::RecordsProcessed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::RecordsStored)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::RecordsPushed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::RecordsFailed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ConflictsDetected)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::ConflictsResolved)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::BytesTransferred)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_jobs_connection_id")
                            .from(SyncJobs::Table, SyncJobs::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_status_priority_created")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::Status)
                    .col(SyncJobs::Priority)
                    .col(SyncJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_connection_status")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::ConnectionId)
                    .col(SyncJobs::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_jobs_status_priority_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_jobs_connection_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum SyncJobs {
    Table,
    Id,
    ConnectionId,
    ProviderSlug,
    JobType,
    Direction,
    Priority,
    Status,
    PatientId,
    ResourceTypes,
    ResourceId,
    Since,
    AttemptCount,
    MaxAttempts,
    LastError,
    RecordsProcessed,
    RecordsStored,
    RecordsPushed,
    RecordsFailed,
    ConflictsDetected,
    ConflictsResolved,
    BytesTransferred,
    CreatedAt,
    StartedAt,
    CompletedAt,
    UpdatedAt,
}
