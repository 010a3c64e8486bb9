//! # Conflict API Handlers

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection, rejection::QueryRejection},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{page_size, parse_id, query_rejection, utc};
use crate::auth::OperatorAuth;
use crate::conflicts::ManualDecision;
use crate::error::{ApiError, validation_error};
use crate::models::enums::{ConflictStatus, ConflictStrategy, parse_enum};
use crate::models::sync_conflict::Model as ConflictModel;
use crate::repositories::sync_conflict::ConflictFilter;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConflictsQuery {
    /// One of OPEN, AUTO_RESOLVED, RESOLVED, IGNORED
    pub status: Option<String>,
    pub connection_id: Option<Uuid>,
    pub limit: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub connection_id: Uuid,
    pub provider_slug: String,
    #[schema(example = "Observation")]
    pub resource_type: String,
    pub resource_id: String,
    #[schema(value_type = Object)]
    pub local_value: JsonValue,
    #[schema(value_type = Object)]
    pub remote_value: JsonValue,
    pub local_modified_at: Option<DateTime<Utc>>,
    pub remote_modified_at: Option<DateTime<Utc>>,
    pub status: ConflictStatus,
    pub strategy: ConflictStrategy,
    #[schema(value_type = Option<Object>)]
    pub outcome: Option<JsonValue>,
    pub escalation_reason: Option<String>,
    pub resolved_by: Option<String>,
    pub reason: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub propagated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation_error: Option<String>,
}

impl From<ConflictModel> for ConflictInfo {
    fn from(model: ConflictModel) -> Self {
        Self {
            id: model.id,
            job_id: model.job_id,
            connection_id: model.connection_id,
            provider_slug: model.provider_slug,
            resource_type: model.resource_type,
            resource_id: model.resource_id,
            local_value: model.local_value,
            remote_value: model.remote_value,
            local_modified_at: model.local_modified_at.map(utc),
            remote_modified_at: model.remote_modified_at.map(utc),
            status: model.status,
            strategy: model.strategy,
            outcome: model.outcome,
            escalation_reason: model.escalation_reason,
            resolved_by: model.resolved_by,
            reason: model.reason,
            detected_at: utc(model.detected_at),
            resolved_at: model.resolved_at.map(utc),
            propagated_at: model.propagated_at.map(utc),
            propagation_error: model.propagation_error,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    pub strategy: ManualDecision,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictResponse {
    pub conflict: ConflictInfo,
    /// The record that now stands; absent when the conflict was ignored
    #[schema(value_type = Option<Object>)]
    pub record: Option<JsonValue>,
    /// True when the conflict had already been settled before this request
    pub already_resolved: bool,
    pub propagation_job_id: Option<String>,
}

/// List conflicts
#[utoipa::path(
    get,
    path = "/sync/conflicts",
    security(("bearer_auth" = [])),
    params(
        ("status" = Option<ConflictStatus>, Query, description = "Filter by status, e.g. OPEN"),
        ("connectionId" = Option<Uuid>, Query, description = "Filter by connection"),
        ("limit" = Option<u64>, Query, description = "Maximum number of conflicts (default 50, max 200)")
    ),
    responses(
        (status = 200, description = "Conflicts, newest first", body = [ConflictInfo]),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "conflicts"
)]
pub async fn list_conflicts(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    query: Result<Query<ListConflictsQuery>, QueryRejection>,
) -> Result<Json<Vec<ConflictInfo>>, ApiError> {
    let Query(params) = query.map_err(query_rejection)?;
    let status = match params.status.as_deref() {
        Some(raw) => Some(parse_enum::<ConflictStatus>(raw).ok_or_else(|| {
            validation_error(
                "Invalid status",
                serde_json::json!({ "status": format!("Unknown conflict status '{raw}'") }),
            )
        })?),
        None => None,
    };

    let conflicts = state
        .engine
        .conflicts
        .list(ConflictFilter {
            status,
            connection_id: params.connection_id,
            limit: Some(page_size(params.limit)?),
        })
        .await?;
    Ok(Json(conflicts.into_iter().map(ConflictInfo::from).collect()))
}

/// Apply a manual decision to an OPEN conflict
#[utoipa::path(
    post,
    path = "/sync/conflicts/{id}/resolve",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Conflict id")),
    request_body = ResolveConflictRequest,
    responses(
        (status = 200, description = "Final resolved record", body = ResolveConflictResponse),
        (status = 400, description = "Decision cannot settle this conflict", body = ApiError),
        (status = 404, description = "Conflict not found", body = ApiError)
    ),
    tag = "conflicts"
)]
pub async fn resolve_conflict(
    State(state): State<AppState>,
    operator: OperatorAuth,
    Path(id): Path<String>,
    payload: Result<Json<ResolveConflictRequest>, JsonRejection>,
) -> Result<Json<ResolveConflictResponse>, ApiError> {
    let conflict_id = parse_id(&id, "id")?;
    let Json(request) = payload?;
    let reason = request
        .reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty());

    let resolved = state
        .engine
        .conflicts
        .resolve_conflict(conflict_id, request.strategy, reason, &operator.operator)
        .await?;

    Ok(Json(ResolveConflictResponse {
        conflict: ConflictInfo::from(resolved.conflict),
        record: resolved.record,
        already_resolved: resolved.already_resolved,
        propagation_job_id: resolved.propagation_job_id,
    }))
}
