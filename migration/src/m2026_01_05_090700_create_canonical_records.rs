//! Migration to create the canonical_records table, the local side of every sync.

use sea_orm_migration::prelude::*;

use crate::m2026_01_05_090000_create_connections::Connections;

#[derive(DeriveMigrationName)]
pub struct Migration;

const RECORD_KEY_INDEX: &str = "uq_canonical_records_key";

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CanonicalRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CanonicalRecords::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CanonicalRecords::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(CanonicalRecords::ResourceType).text().not_null())
                    .col(ColumnDef::new(CanonicalRecords::ResourceId).text().not_null())
                    .col(ColumnDef::new(CanonicalRecords::Data).json_binary().not_null())
                    .col(
                        ColumnDef::new(CanonicalRecords::ModifiedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CanonicalRecords::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CanonicalRecords::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_canonical_records_connection_id")
                            .from(CanonicalRecords::Table, CanonicalRecords::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name(RECORD_KEY_INDEX)
                    .table(CanonicalRecords::Table)
                    .col(CanonicalRecords::ConnectionId)
                    .col(CanonicalRecords::ResourceType)
                    .col(CanonicalRecords::ResourceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name(RECORD_KEY_INDEX).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(CanonicalRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CanonicalRecords {
    Table,
    Id,
    ConnectionId,
    ResourceType,
    ResourceId,
    Data,
    ModifiedAt,
    CreatedAt,
    UpdatedAt,
}
