//! Migration to create the webhook_configs and webhook_logs tables.

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
                    .table(WebhookConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookConfigs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookConfigs::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(WebhookConfigs::Endpoint).text().not_null())
                    .col(
                        ColumnDef::new(WebhookConfigs::SecretCiphertext)
                            .binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WebhookConfigs::Events).json_binary().not_null())
                    .col(
                        ColumnDef::new(WebhookConfigs::SignatureAlgorithm)
                            .text()
                            .not_null()
                            .default("SHA256"),
                    )
                    .col(
                        ColumnDef::new(WebhookConfigs::RetryAttempts)
                            .integer()
                            .not_null()
                            .default(3),
                    )
                    .col(
                        ColumnDef::new(WebhookConfigs::RetryDelayMs)
                            .big_integer()
                            .not_null()
                            .default(1000),
                    )
                    .col(
                        ColumnDef::new(WebhookConfigs::TimeoutMs)
                            .big_integer()
                            .not_null()
                            .default(10000),
                    )
                    .col(
                        ColumnDef::new(WebhookConfigs::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(WebhookConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(WebhookConfigs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_configs_connection_id")
                            .from(WebhookConfigs::Table, WebhookConfigs::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WebhookLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookLogs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WebhookLogs::ConfigId).uuid().not_null())
                    .col(ColumnDef::new(WebhookLogs::Direction).text().not_null())
                    .col(ColumnDef::new(WebhookLogs::EventType).text().null())
                    .col(ColumnDef::new(WebhookLogs::PayloadHash).text().not_null())
                    .col(ColumnDef::new(WebhookLogs::Payload).json_binary().null())
                    .col(ColumnDef::new(WebhookLogs::SignatureValid).boolean().null())
                    .col(ColumnDef::new(WebhookLogs::Outcome).text().not_null())
                    .col(ColumnDef::new(WebhookLogs::HttpStatus).integer().null())
                    .col(
                        ColumnDef::new(WebhookLogs::Attempt)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(WebhookLogs::Error).text().null())
                    .col(ColumnDef::new(WebhookLogs::QueueJobId).text().null())
                    .col(
                        ColumnDef::new(WebhookLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_webhook_logs_config_id")
                            .from(WebhookLogs::Table, WebhookLogs::ConfigId)
                            .to(WebhookConfigs::Table, WebhookConfigs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_logs_config_created")
                    .table(WebhookLogs::Table)
                    .col(WebhookLogs::ConfigId)
                    .col(WebhookLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_webhook_logs_config_created")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(WebhookLogs::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(WebhookConfigs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum WebhookConfigs {
    Table,
    Id,
    ConnectionId,
    Endpoint,
    SecretCiphertext,
    Events,
    SignatureAlgorithm,
    RetryAttempts,
    RetryDelayMs,
    TimeoutMs,
    Active,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum WebhookLogs {
    Table,
    Id,
    ConfigId,
    Direction,
    EventType,
    PayloadHash,
    Payload,
    SignatureValid,
    Outcome,
    HttpStatus,
    Attempt,
    Error,
    QueueJobId,
    CreatedAt,
}
