//! WebhookConfig entity model
//!
//! Per-connection webhook registration. The shared secret is stored encrypted;
//! see [`crate::crypto`].

use super::enums::SignatureAlgorithm;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub connection_id: Uuid,

    /// Destination URL for outbound event delivery
    pub endpoint: String,

    /// AES-256-GCM ciphertext of the shared secret, AAD bound to `id`
    pub secret_ciphertext: Vec<u8>,

    /// JSON array of subscribed event types; `*` subscribes to everything
    #[sea_orm(column_type = "JsonBinary")]
    pub events: JsonValue,

    pub signature_algorithm: SignatureAlgorithm,

    pub retry_attempts: i32,

    pub retry_delay_ms: i64,

    pub timeout_ms: i64,

    pub active: bool,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    pub fn event_list(&self) -> Vec<String> {
        self.events
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether this config subscribes to `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_list()
            .iter()
            .any(|event| event == "*" || event == event_type)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::connection::Entity",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
    #[sea_orm(has_many = "super::webhook_log::Entity")]
    WebhookLog,
}

impl Related<super::connection::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl Related<super::webhook_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WebhookLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
