//! Migration to create the sync_conflicts table.

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
                    .table(SyncConflicts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncConflicts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncConflicts::JobId).uuid().null())
                    .col(ColumnDef::new(SyncConflicts::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(SyncConflicts::ProviderSlug).text().not_null())
                    .col(ColumnDef::new(SyncConflicts::ResourceType).text().not_null())
                    .col(ColumnDef::new(SyncConflicts::ResourceId).text().not_null())
                    .col(
                        ColumnDef::new(SyncConflicts::LocalValue)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::RemoteValue)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::LocalModifiedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::RemoteModifiedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::Status)
                            .text()
                            .not_null()
                            .default("OPEN"),
                    )
                    .col(ColumnDef::new(SyncConflicts::Strategy).text().not_null())
                    .col(ColumnDef::new(SyncConflicts::Outcome).json_binary().null())
                    .col(ColumnDef::new(SyncConflicts::EscalationReason).text().null())
                    .col(ColumnDef::new(SyncConflicts::ResolvedBy).text().null())
                    .col(ColumnDef::new(SyncConflicts::Reason).text().null())
                    .col(
                        ColumnDef::new(SyncConflicts::DetectedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::ResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncConflicts::PropagatedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncConflicts::PropagationError).text().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_conflicts_connection_id")
                            .from(SyncConflicts::Table, SyncConflicts::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_conflicts_status_detected")
                    .table(SyncConflicts::Table)
                    .col(SyncConflicts::Status)
                    .col(SyncConflicts::DetectedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_conflicts_status_detected")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncConflicts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncConflicts {
    Table,
    Id,
    JobId,
    ConnectionId,
    ProviderSlug,
    ResourceType,
    ResourceId,
    LocalValue,
    RemoteValue,
    LocalModifiedAt,
    RemoteModifiedAt,
    Status,
    Strategy,
    Outcome,
    EscalationReason,
    ResolvedBy,
    Reason,
    DetectedAt,
    ResolvedAt,
    PropagatedAt,
    PropagationError,
}
