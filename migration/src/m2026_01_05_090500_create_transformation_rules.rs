//! Migration to create the transformation_rules table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TransformationRules::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TransformationRules::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TransformationRules::ProviderSlug)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransformationRules::ResourceType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransformationRules::Priority)
                            .integer()
                            .not_null()
                            .default(100),
                    )
                    .col(
                        ColumnDef::new(TransformationRules::SchemaVersion)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(TransformationRules::Rule)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(TransformationRules::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(TransformationRules::CreatedAt)
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
                    .name("idx_transformation_rules_scope")
                    .table(TransformationRules::Table)
                    .col(TransformationRules::ProviderSlug)
                    .col(TransformationRules::ResourceType)
                    .col(TransformationRules::Priority)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_transformation_rules_scope")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(TransformationRules::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TransformationRules {
    Table,
    Id,
    ProviderSlug,
    ResourceType,
    Priority,
    SchemaVersion,
    Rule,
    Active,
    CreatedAt,
}
