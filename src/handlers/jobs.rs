//! # Jobs API Handlers
//!
//! Create, inspect, cancel and retry sync jobs.

use axum::{
    extract::{Path, Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

use super::{page_size, parse_id, query_rejection, utc};
use crate::auth::OperatorAuth;
use crate::error::{ApiError, validation_error};
use crate::models::enums::{
    ErrorSeverity, FailureKind, JobStatus, JobType, SyncDirection, parse_enum,
};
use crate::models::sync_error::Model as SyncErrorModel;
use crate::models::sync_job::{JobSummary, Model as SyncJobModel};
use crate::orchestrator::JobSpec;
use crate::repositories::sync_job::JobFilter;
use crate::server::AppState;

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub connection_id: Option<Uuid>,
    /// One of PENDING, PROCESSING, COMPLETED, FAILED, RETRYING, CANCELLED
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorInfo {
    pub id: Uuid,
    pub code: String,
    pub kind: FailureKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub resource_ref: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub context: Option<JsonValue>,
    /// True for the error that ended the job
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
}

impl From<SyncErrorModel> for SyncErrorInfo {
    fn from(model: SyncErrorModel) -> Self {
        Self {
            id: model.id,
            code: model.code,
            kind: model.kind,
            severity: model.severity,
            message: model.message,
            resource_ref: model.resource_ref,
            context: model.context,
            terminal: model.terminal,
            created_at: utc(model.created_at),
        }
    }
}

/// Job record as returned by the API
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: Uuid,
    pub connection_id: Uuid,
    #[schema(example = "epic")]
    pub provider_slug: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub direction: SyncDirection,
    #[schema(example = 3)]
    pub priority: i16,
    pub status: JobStatus,
    pub patient_id: Option<String>,
    pub resource_types: Vec<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub max_attempts: i32,
    #[schema(value_type = Option<Object>)]
    pub last_error: Option<JsonValue>,
    pub summary: JobSummary,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Present on single-job responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<SyncErrorInfo>>,
}

impl From<SyncJobModel> for JobInfo {
    fn from(model: SyncJobModel) -> Self {
        let summary = JobSummary::from(&model);
        let resource_types = model.resource_type_list();
        Self {
            id: model.id,
            connection_id: model.connection_id,
            provider_slug: model.provider_slug,
            job_type: model.job_type,
            direction: model.direction,
            priority: model.priority,
            status: model.status,
            patient_id: model.patient_id,
            resource_types,
            resource_id: model.resource_id,
            since: model.since.map(utc),
            attempt_count: model.attempt_count,
            max_attempts: model.max_attempts,
            last_error: model.last_error,
            summary,
            created_at: utc(model.created_at),
            started_at: model.started_at.map(utc),
            completed_at: model.completed_at.map(utc),
            errors: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    pub jobs: Vec<JobInfo>,
}

/// Create a sync job
#[utoipa::path(
    post,
    path = "/sync/jobs",
    security(("bearer_auth" = [])),
    request_body = JobSpec,
    responses(
        (status = 202, description = "Job accepted and queued", body = CreateJobResponse),
        (status = 400, description = "Invalid job request", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 422, description = "Connection is not active", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn create_job(
    State(state): State<AppState>,
    operator: OperatorAuth,
    payload: Result<Json<JobSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let Json(spec) = payload?;
    let job = state.engine.orchestrator.create_job(spec).await?;
    tracing::info!(job_id = %job.id, operator = %operator.operator, "Job requested via API");

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// List sync jobs
#[utoipa::path(
    get,
    path = "/sync/jobs",
    security(("bearer_auth" = [])),
    params(
        ("connectionId" = Option<Uuid>, Query, description = "Filter by connection"),
        ("status" = Option<JobStatus>, Query, description = "Filter by job status"),
        ("limit" = Option<u64>, Query, description = "Maximum number of jobs (default 50, max 200)"),
        ("offset" = Option<u64>, Query, description = "Number of jobs to skip")
    ),
    responses(
        (status = 200, description = "Jobs, newest first", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<JobsResponse>, ApiError> {
    let Query(params) = query.map_err(query_rejection)?;
    let status = match params.status.as_deref() {
        Some(raw) => Some(parse_enum::<JobStatus>(raw).ok_or_else(|| {
            validation_error(
                "Invalid status",
                serde_json::json!({ "status": format!("Unknown job status '{raw}'") }),
            )
        })?),
        None => None,
    };

    let jobs = state
        .engine
        .orchestrator
        .list_jobs(JobFilter {
            connection_id: params.connection_id,
            status,
            limit: Some(page_size(params.limit)?),
            offset: params.offset,
        })
        .await?;

    Ok(Json(JobsResponse {
        jobs: jobs.into_iter().map(JobInfo::from).collect(),
    }))
}

/// Get a sync job with its errors
#[utoipa::path(
    get,
    path = "/sync/jobs/{id}",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job details", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, ApiError> {
    let job_id = parse_id(&id, "id")?;
    let details = state.engine.orchestrator.get_job(job_id).await?;

    let mut info = JobInfo::from(details.job);
    info.errors = Some(details.errors.into_iter().map(SyncErrorInfo::from).collect());
    Ok(Json(info))
}

/// Cancel a pending or running job
#[utoipa::path(
    delete,
    path = "/sync/jobs/{id}",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job cancelled", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job is already finished", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AppState>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, ApiError> {
    let job_id = parse_id(&id, "id")?;
    let job = state.engine.orchestrator.cancel_job(job_id).await?;
    tracing::info!(job_id = %job_id, operator = %operator.operator, "Job cancelled via API");
    Ok(Json(JobInfo::from(job)))
}

/// Re-enqueue a FAILED job
#[utoipa::path(
    post,
    path = "/sync/jobs/{id}/retry",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 202, description = "Job queued again", body = JobInfo),
        (status = 404, description = "Job not found", body = ApiError),
        (status = 409, description = "Job is not FAILED", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn retry_job(
    State(state): State<AppState>,
    operator: OperatorAuth,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobInfo>), ApiError> {
    let job_id = parse_id(&id, "id")?;
    let job = state.engine.orchestrator.retry_job(job_id).await?;
    tracing::info!(job_id = %job_id, operator = %operator.operator, "Job retry requested via API");
    Ok((StatusCode::ACCEPTED, Json(JobInfo::from(job))))
}

/// List the errors recorded against a job
#[utoipa::path(
    get,
    path = "/sync/jobs/{id}/errors",
    security(("bearer_auth" = [])),
    params(("id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Errors, oldest first", body = [SyncErrorInfo]),
        (status = 404, description = "Job not found", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_job_errors(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Path(id): Path<String>,
) -> Result<Json<Vec<SyncErrorInfo>>, ApiError> {
    let job_id = parse_id(&id, "id")?;
    let errors = state.engine.orchestrator.list_errors(job_id).await?;
    Ok(Json(errors.into_iter().map(SyncErrorInfo::from).collect()))
}
