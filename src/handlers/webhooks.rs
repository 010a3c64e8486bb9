//! # Webhook API Handlers
//!
//! Registration and log inspection sit behind operator auth. The receive
//! endpoint is public: callers prove themselves with the payload signature
//! for the config named in `X-Webhook-Id`.

use axum::{
    body::Bytes,
    extract::{Path, Query, State, rejection::BytesRejection, rejection::JsonRejection, rejection::QueryRejection},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{page_size, parse_id, query_rejection, utc};
use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::models::enums::{SignatureAlgorithm, WebhookDirection, WebhookOutcome};
use crate::models::webhook_config::Model as WebhookConfigModel;
use crate::models::webhook_log::Model as WebhookLogModel;
use crate::server::AppState;
use crate::webhooks::{ReceiveAck, RegisterWebhook, WebhookError};

/// Registered webhook config. The shared secret is never returned.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfigInfo {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub endpoint: String,
    pub events: Vec<String>,
    pub signature_algorithm: SignatureAlgorithm,
    pub retry_attempts: i32,
    /// Milliseconds between delivery retries
    pub retry_delay: i64,
    /// Per-attempt delivery timeout in milliseconds
    pub timeout: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookConfigModel> for WebhookConfigInfo {
    fn from(model: WebhookConfigModel) -> Self {
        let events = model.event_list();
        Self {
            id: model.id,
            connection_id: model.connection_id,
            endpoint: model.endpoint,
            events,
            signature_algorithm: model.signature_algorithm,
            retry_attempts: model.retry_attempts,
            retry_delay: model.retry_delay_ms,
            timeout: model.timeout_ms,
            active: model.active,
            created_at: utc(model.created_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLogInfo {
    pub id: Uuid,
    pub direction: WebhookDirection,
    pub event_type: Option<String>,
    pub payload_hash: String,
    #[schema(value_type = Option<Object>)]
    pub payload: Option<JsonValue>,
    pub signature_valid: Option<bool>,
    pub outcome: WebhookOutcome,
    pub http_status: Option<i32>,
    pub attempt: i32,
    pub error: Option<String>,
    pub queue_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<WebhookLogModel> for WebhookLogInfo {
    fn from(model: WebhookLogModel) -> Self {
        Self {
            id: model.id,
            direction: model.direction,
            event_type: model.event_type,
            payload_hash: model.payload_hash,
            payload: model.payload,
            signature_valid: model.signature_valid,
            outcome: model.outcome,
            http_status: model.http_status,
            attempt: model.attempt,
            error: model.error,
            queue_job_id: model.queue_job_id,
            created_at: utc(model.created_at),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookLogsResponse {
    pub config_id: Uuid,
    pub entries: Vec<WebhookLogInfo>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryDeliveryResponse {
    pub queue_job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<u64>,
}

/// Register a webhook for a connection
#[utoipa::path(
    post,
    path = "/sync/webhooks",
    security(("bearer_auth" = [])),
    request_body = RegisterWebhook,
    responses(
        (status = 201, description = "Webhook registered", body = WebhookConfigInfo),
        (status = 400, description = "Invalid registration", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Connection not found or inactive", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn register_webhook(
    State(state): State<AppState>,
    operator: OperatorAuth,
    payload: Result<Json<RegisterWebhook>, JsonRejection>,
) -> Result<(StatusCode, Json<WebhookConfigInfo>), ApiError> {
    let Json(request) = payload?;
    let config = state.engine.webhooks.register(request).await?;
    tracing::info!(webhook_config_id = %config.id, operator = %operator.operator, "Webhook registered via API");
    Ok((StatusCode::CREATED, Json(WebhookConfigInfo::from(config))))
}

/// Receive a signed provider event
#[utoipa::path(
    post,
    path = "/sync/webhooks/receive",
    params(
        ("X-Webhook-Id" = Uuid, Header, description = "Webhook config the payload is signed for"),
        ("X-Signature-SHA256" = Option<String>, Header, description = "Hex HMAC-SHA256 of the raw body"),
        ("X-Signature-SHA512" = Option<String>, Header, description = "Hex HMAC-SHA512 of the raw body")
    ),
    request_body(content = crate::webhooks::InboundEvent, content_type = "application/json"),
    responses(
        (status = 202, description = "Event accepted or acknowledged", body = ReceiveAck),
        (status = 400, description = "Malformed payload", body = ApiError),
        (status = 401, description = "Signature missing or invalid", body = ApiError),
        (status = 404, description = "Unknown or inactive webhook config", body = ApiError),
        (status = 409, description = "Payload replayed within the replay window", body = ApiError),
        (status = 413, description = "Payload too large", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<ReceiveAck>), ApiError> {
    let body = body.map_err(|_| WebhookError::PayloadTooLarge {
        limit_bytes: state.engine.webhooks.max_body_bytes(),
    })?;
    let ack = state.engine.webhooks.receive(&headers, &body).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

/// Redeliver the most recent failed outbound event
#[utoipa::path(
    post,
    path = "/sync/webhooks/{id}/retry",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Webhook config id")),
    responses(
        (status = 202, description = "Redelivery queued", body = RetryDeliveryResponse),
        (status = 404, description = "Config or failed delivery not found", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn retry_webhook(
    State(state): State<AppState>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RetryDeliveryResponse>), ApiError> {
    let config_id = parse_id(&id, "id")?;
    let queue_job_id = state.engine.webhooks.retry_last_failed(config_id).await?;
    tracing::info!(webhook_config_id = %config_id, operator = %operator.operator, "Webhook redelivery requested via API");
    Ok((StatusCode::ACCEPTED, Json(RetryDeliveryResponse { queue_job_id })))
}

/// Inbound and outbound log entries for a webhook config
#[utoipa::path(
    get,
    path = "/sync/webhooks/{id}/logs",
    security(("bearer_auth" = [])),
    params(
        ("id" = Uuid, Path, description = "Webhook config id"),
        ("limit" = Option<u64>, Query, description = "Maximum number of entries (default 50, max 200)")
    ),
    responses(
        (status = 200, description = "Log entries, newest first", body = WebhookLogsResponse),
        (status = 404, description = "Webhook config not found", body = ApiError)
    ),
    tag = "webhooks"
)]
pub async fn list_webhook_logs(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Path(id): Path<String>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Json<WebhookLogsResponse>, ApiError> {
    let config_id = parse_id(&id, "id")?;
    let Query(params) = query.map_err(query_rejection)?;
    let entries = state
        .engine
        .webhooks
        .list_logs(config_id, page_size(params.limit)?)
        .await?;
    Ok(Json(WebhookLogsResponse {
        config_id,
        entries: entries.into_iter().map(WebhookLogInfo::from).collect(),
    }))
}
