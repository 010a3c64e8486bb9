//! # Webhooks
//!
//! Registration of per-connection webhook configs, verified ingestion of
//! provider events, routing of accepted events, and signed outbound delivery
//! of engine lifecycle events. Every inbound request and every outbound
//! attempt leaves one append-only `webhook_logs` row.

mod delivery;
mod receiver;
pub mod verification;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sea_orm::{DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::collaborators::Collaborators;
use crate::config::WebhooksConfig;
use crate::crypto::{self, CryptoError, CryptoKey};
use crate::events::EventBus;
use crate::models::enums::SignatureAlgorithm;
use crate::models::webhook_config::Model as WebhookConfigModel;
use crate::models::webhook_log::Model as WebhookLogModel;
use crate::orchestrator::Orchestrator;
use crate::queue::{JobQueues, QueueError};
use crate::repositories::webhook_config::NewWebhookConfig;
use crate::repositories::{WebhookConfigRepository, WebhookLogRepository};

pub use delivery::spawn_fan_out;
pub use receiver::{ReceiveAck, WEBHOOK_ID_HEADER};
pub use verification::ReplayGuard;

pub const RETRY_ATTEMPTS_RANGE: std::ops::RangeInclusive<u32> = 1..=10;
pub const RETRY_DELAY_MS_RANGE: std::ops::RangeInclusive<u64> = 100..=3_600_000;
pub const TIMEOUT_MS_RANGE: std::ops::RangeInclusive<u64> = 1_000..=60_000;
const MIN_SECRET_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown or inactive webhook config")]
    UnknownConfig,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("missing webhook signature")]
    MissingSignature,
    #[error("webhook signature verification failed")]
    InvalidSignature,
    #[error("payload already received within the replay window")]
    Replay,
    #[error("malformed webhook payload: {0}")]
    Malformed(String),
    #[error("payload exceeds {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: usize },
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
    },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl WebhookError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        WebhookError::Validation {
            field: Some(field.to_string()),
            message: message.into(),
        }
    }
}

/// Body of an inbound provider event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    /// Inline resource body; when absent the resource is fetched by a sync job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<JsonValue>,
}

/// Event types whose payload is routed into the engine; anything else is
/// logged and acknowledged.
pub const PROCESSED_EVENT_TYPES: &[&str] = &["resource.created", "resource.updated"];

/// Webhook registration request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWebhook {
    pub connection_id: Uuid,
    pub endpoint: String,
    pub secret: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    /// Milliseconds between delivery retries
    #[serde(default)]
    pub retry_delay: Option<u64>,
    /// Per-attempt delivery timeout in milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,
}

pub struct WebhookService {
    configs: WebhookConfigRepository,
    logs: WebhookLogRepository,
    collaborators: Collaborators,
    adapters: Arc<AdapterRegistry>,
    orchestrator: Arc<Orchestrator>,
    queues: JobQueues,
    events: EventBus,
    crypto_key: CryptoKey,
    replay_guard: ReplayGuard,
    client: Client,
    settings: WebhooksConfig,
}

impl WebhookService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        settings: WebhooksConfig,
        crypto_key: CryptoKey,
        collaborators: Collaborators,
        adapters: Arc<AdapterRegistry>,
        orchestrator: Arc<Orchestrator>,
        queues: JobQueues,
        events: EventBus,
    ) -> Self {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!(error = %error, "Falling back to default webhook HTTP client");
                Client::new()
            });
        Self {
            configs: WebhookConfigRepository::new(db.clone()),
            logs: WebhookLogRepository::new(db),
            collaborators,
            adapters,
            orchestrator,
            queues,
            events,
            crypto_key,
            replay_guard: ReplayGuard::new(Duration::from_secs(settings.replay_window_seconds)),
            client,
            settings,
        }
    }

    pub fn max_body_bytes(&self) -> usize {
        self.settings.max_body_kb * 1024
    }

    /// Validates and stores a webhook config with its secret encrypted at rest.
    pub async fn register(
        &self,
        request: RegisterWebhook,
    ) -> Result<WebhookConfigModel, WebhookError> {
        let endpoint = url::Url::parse(request.endpoint.trim())
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .ok_or_else(|| WebhookError::validation("endpoint", "endpoint must be an http(s) URL"))?;
        if request.secret.len() < MIN_SECRET_LEN {
            return Err(WebhookError::validation(
                "secret",
                format!("secret must be at least {MIN_SECRET_LEN} characters"),
            ));
        }
        let events: Vec<String> = request
            .events
            .iter()
            .map(|event| event.trim().to_string())
            .filter(|event| !event.is_empty())
            .collect();
        if events.is_empty() {
            return Err(WebhookError::validation(
                "events",
                "at least one event type is required",
            ));
        }

        let retry_attempts = request
            .retry_attempts
            .unwrap_or(self.settings.default_retry_attempts);
        if !RETRY_ATTEMPTS_RANGE.contains(&retry_attempts) {
            return Err(WebhookError::validation(
                "retryAttempts",
                "retryAttempts must be between 1 and 10",
            ));
        }
        let retry_delay_ms = request
            .retry_delay
            .unwrap_or(self.settings.default_retry_delay_ms);
        if !RETRY_DELAY_MS_RANGE.contains(&retry_delay_ms) {
            return Err(WebhookError::validation(
                "retryDelay",
                "retryDelay must be between 100 and 3600000 milliseconds",
            ));
        }
        let timeout_ms = request.timeout.unwrap_or(self.settings.default_timeout_ms);
        if !TIMEOUT_MS_RANGE.contains(&timeout_ms) {
            return Err(WebhookError::validation(
                "timeout",
                "timeout must be between 1000 and 60000 milliseconds",
            ));
        }

        if self
            .collaborators
            .directory
            .get_active_connection(request.connection_id)
            .await?
            .is_none()
        {
            return Err(WebhookError::NotFound {
                entity: "connection",
                id: request.connection_id.to_string(),
            });
        }

        let id = Uuid::new_v4();
        let secret_ciphertext = crypto::encrypt_webhook_secret(&self.crypto_key, id, &request.secret)?;
        let config = self
            .configs
            .insert(NewWebhookConfig {
                id,
                connection_id: request.connection_id,
                endpoint: endpoint.to_string(),
                secret_ciphertext,
                events,
                signature_algorithm: request
                    .signature_algorithm
                    .unwrap_or(SignatureAlgorithm::Sha256),
                retry_attempts: retry_attempts as i32,
                retry_delay_ms: retry_delay_ms as i64,
                timeout_ms: timeout_ms as i64,
            })
            .await?;

        tracing::info!(
            webhook_config_id = %config.id,
            connection_id = %config.connection_id,
            algorithm = ?config.signature_algorithm,
            "Webhook registered"
        );
        Ok(config)
    }

    pub async fn get_config(&self, id: Uuid) -> Result<WebhookConfigModel, WebhookError> {
        self.configs
            .find_by_id(id)
            .await?
            .ok_or_else(|| WebhookError::NotFound {
                entity: "webhook config",
                id: id.to_string(),
            })
    }

    pub async fn list_logs(
        &self,
        config_id: Uuid,
        limit: u64,
    ) -> Result<Vec<WebhookLogModel>, WebhookError> {
        self.get_config(config_id).await?;
        Ok(self.logs.list_for_config(config_id, limit).await?)
    }

    fn secret_for(
        &self,
        config: &WebhookConfigModel,
    ) -> Result<zeroize::Zeroizing<Vec<u8>>, CryptoError> {
        crypto::decrypt_webhook_secret(&self.crypto_key, config.id, &config.secret_ciphertext)
    }
}
