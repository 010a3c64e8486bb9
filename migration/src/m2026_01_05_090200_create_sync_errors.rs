//! Migration to create the sync_errors table (append-only failure records per job).

use sea_orm_migration::prelude::*;

use crate::m2026_01_05_090100_create_sync_jobs::SyncJobs;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncErrors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncErrors::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncErrors::JobId).uuid().not_null())
                    .col(ColumnDef::new(SyncErrors::Code).text().not_null())
                    .col(ColumnDef::new(SyncErrors::Kind).text().not_null())
                    .col(ColumnDef::new(SyncErrors::Severity).text().not_null())
                    .col(ColumnDef::new(SyncErrors::Message).text().not_null())
                    .col(ColumnDef::new(SyncErrors::ResourceRef).text().null())
                    .col(ColumnDef::new(SyncErrors::Context).json_binary().null())
                    .col(
                        ColumnDef::new(SyncErrors::Terminal)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(SyncErrors::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_errors_job_id")
                            .from(SyncErrors::Table, SyncErrors::JobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_errors_job_created")
                    .table(SyncErrors::Table)
                    .col(SyncErrors::JobId)
                    .col(SyncErrors::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_errors_job_created").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncErrors::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncErrors {
    Table,
    Id,
    JobId,
    Code,
    Kind,
    Severity,
    Message,
    ResourceRef,
    Context,
    Terminal,
    CreatedAt,
}
