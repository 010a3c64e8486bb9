//! WebhookLog entity model: one append-only row per inbound or outbound attempt.

use super::enums::{WebhookDirection, WebhookOutcome};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "webhook_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub config_id: Uuid,

    pub direction: WebhookDirection,

    pub event_type: Option<String>,

    /// Hex SHA-256 of the raw payload bytes
    pub payload_hash: String,

    /// Parsed payload, kept so failed events can be redelivered
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: Option<JsonValue>,

    /// `None` when verification did not apply (outbound attempts)
    pub signature_valid: Option<bool>,

    pub outcome: WebhookOutcome,

    pub http_status: Option<i32>,

    pub attempt: i32,

    pub error: Option<String>,

    /// Id of the queue job spawned from this entry
    pub queue_job_id: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::webhook_config::Entity",
        from = "Column::ConfigId",
        to = "super::webhook_config::Column::Id"
    )]
    WebhookConfig,
}

impl Related<super::webhook_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WebhookConfig.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
