//! # Statistics API Handler

use axum::{
    extract::{Query, State, rejection::QueryRejection},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::query_rejection;
use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::server::AppState;
use crate::statistics::StatisticsReport;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsQuery {
    pub connection_id: Option<Uuid>,
    /// `Nd` (1-365) or `Nh`; defaults to `7d`
    pub range: Option<String>,
}

/// Aggregated sync counters per day
#[utoipa::path(
    get,
    path = "/sync/statistics",
    security(("bearer_auth" = [])),
    params(
        ("connectionId" = Option<Uuid>, Query, description = "Restrict to one connection"),
        ("range" = Option<String>, Query, description = "Window such as 7d or 48h (default 7d)")
    ),
    responses(
        (status = 200, description = "Per-day rows and totals", body = StatisticsReport),
        (status = 400, description = "Invalid range", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "statistics"
)]
pub async fn get_statistics(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    query: Result<Query<StatisticsQuery>, QueryRejection>,
) -> Result<Json<StatisticsReport>, ApiError> {
    let Query(params) = query.map_err(query_rejection)?;
    let report = state
        .engine
        .statistics
        .query(params.connection_id, params.range.as_deref())
        .await?;
    Ok(Json(report))
}
