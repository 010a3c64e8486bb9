//! # Health Handlers

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, response::Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db;
use crate::models::ServiceInfo;
use crate::queue::QueueCounts;
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok` or `degraded`
    #[schema(example = "ok")]
    pub status: String,
    #[schema(example = "up")]
    pub database: String,
    pub version: String,
    pub providers: Vec<String>,
    pub queues: BTreeMap<String, QueueCounts>,
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness plus database and queue state
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database_up = match db::health_check(&state.engine.db).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(error = %error, "Database health check failed");
            false
        }
    };

    let queues = state
        .engine
        .queues
        .counts()
        .await
        .into_iter()
        .map(|(name, counts)| (name.to_string(), counts))
        .collect();

    let status = if database_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if database_up { "ok" } else { "degraded" }.to_string(),
            database: if database_up { "up" } else { "down" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            providers: state.engine.adapters.providers(),
            queues,
        }),
    )
}
