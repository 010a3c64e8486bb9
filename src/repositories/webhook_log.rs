//! Webhook log repository. Rows are only ever appended.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::enums::{WebhookDirection, WebhookOutcome};
use crate::models::webhook_log::{ActiveModel, Column, Entity, Model};

#[derive(Debug, Clone)]
pub struct NewWebhookLog {
    pub id: Uuid,
    pub config_id: Uuid,
    pub direction: WebhookDirection,
    pub event_type: Option<String>,
    pub payload_hash: String,
    pub payload: Option<JsonValue>,
    pub signature_valid: Option<bool>,
    pub outcome: WebhookOutcome,
    pub http_status: Option<i32>,
    pub attempt: i32,
    pub error: Option<String>,
    pub queue_job_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookLogRepository {
    db: DatabaseConnection,
}

impl WebhookLogRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn append(&self, entry: NewWebhookLog) -> Result<Model, DbErr> {
        ActiveModel {
            id: Set(entry.id),
            config_id: Set(entry.config_id),
            direction: Set(entry.direction),
            event_type: Set(entry.event_type),
            payload_hash: Set(entry.payload_hash),
            payload: Set(entry.payload),
            signature_valid: Set(entry.signature_valid),
            outcome: Set(entry.outcome),
            http_status: Set(entry.http_status),
            attempt: Set(entry.attempt),
            error: Set(entry.error),
            queue_job_id: Set(entry.queue_job_id),
            created_at: Set(Utc::now().fixed_offset()),
        }
        .insert(&self.db)
        .await
    }

    /// Newest entries first.
    pub async fn list_for_config(&self, config_id: Uuid, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::ConfigId.eq(config_id))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Attempt)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// Most recent outbound entry for the config, if it ended in DELIVERY_FAILED.
    pub async fn latest_failed_delivery(&self, config_id: Uuid) -> Result<Option<Model>, DbErr> {
        let latest = Entity::find()
            .filter(Column::ConfigId.eq(config_id))
            .filter(Column::Direction.eq(WebhookDirection::Outbound))
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Attempt)
            .one(&self.db)
            .await?;
        Ok(latest.filter(|entry| entry.outcome == WebhookOutcome::DeliveryFailed))
    }
}
