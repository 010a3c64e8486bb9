//! Webhook configuration repository

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

use crate::models::enums::SignatureAlgorithm;
use crate::models::webhook_config::{ActiveModel, Column, Entity, Model};

/// A validated registration, secret already encrypted.
#[derive(Debug, Clone)]
pub struct NewWebhookConfig {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub endpoint: String,
    pub secret_ciphertext: Vec<u8>,
    pub events: Vec<String>,
    pub signature_algorithm: SignatureAlgorithm,
    pub retry_attempts: i32,
    pub retry_delay_ms: i64,
    pub timeout_ms: i64,
}

#[derive(Debug, Clone)]
pub struct WebhookConfigRepository {
    db: DatabaseConnection,
}

impl WebhookConfigRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn insert(&self, config: NewWebhookConfig) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        ActiveModel {
            id: Set(config.id),
            connection_id: Set(config.connection_id),
            endpoint: Set(config.endpoint),
            secret_ciphertext: Set(config.secret_ciphertext),
            events: Set(serde_json::json!(config.events)),
            signature_algorithm: Set(config.signature_algorithm),
            retry_attempts: Set(config.retry_attempts),
            retry_delay_ms: Set(config.retry_delay_ms),
            timeout_ms: Set(config.timeout_ms),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id).one(&self.db).await
    }

    pub async fn find_active(&self, id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(id)
            .filter(Column::Active.eq(true))
            .one(&self.db)
            .await
    }

    pub async fn list_active(&self) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::Active.eq(true))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    pub async fn list_active_for_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Active.eq(true))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }
}
