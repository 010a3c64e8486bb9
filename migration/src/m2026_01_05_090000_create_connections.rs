//! Migration to create the connections table.
//!
//! A connection is one configured link between the platform and an external EHR
//! system. The sync engine only reads it to validate jobs and pick an adapter.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Connections::ProviderSlug).text().not_null())
                    .col(ColumnDef::new(Connections::DisplayName).text().not_null())
                    .col(
                        ColumnDef::new(Connections::Status)
                            .text()
                            .not_null()
                            .default("ACTIVE"),
                    )
                    .col(ColumnDef::new(Connections::BaseUrl).text().null())
                    .col(ColumnDef::new(Connections::Credentials).json_binary().null())
                    .col(
                        ColumnDef::new(Connections::PermittedResourceTypes)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Connections::SyncDirection)
                            .text()
                            .not_null()
                            .default("BIDIRECTIONAL"),
                    )
                    .col(ColumnDef::new(Connections::ConflictStrategy).text().null())
                    .col(
                        ColumnDef::new(Connections::SyncIntervalSeconds)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
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
                    .name("idx_connections_status_provider")
                    .table(Connections::Table)
                    .col(Connections::Status)
                    .col(Connections::ProviderSlug)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_connections_status_provider")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Connections {
    Table,
    Id,
    ProviderSlug,
    DisplayName,
    Status,
    BaseUrl,
    Credentials,
    PermittedResourceTypes,
    SyncDirection,
    ConflictStrategy,
    SyncIntervalSeconds,
    LastSyncedAt,
    CreatedAt,
    UpdatedAt,
}
