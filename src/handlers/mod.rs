//! # API Handlers
//!
//! HTTP endpoints for job management, webhooks, conflicts, statistics and
//! health. Every handler returns [`ApiError`](crate::error::ApiError) as
//! problem+json on failure.

pub mod conflicts;
pub mod health;
pub mod jobs;
pub mod statistics;
pub mod webhooks;

use axum::extract::rejection::QueryRejection;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 200;

/// Parses a path identifier, reporting the offending field on failure.
pub(crate) fn parse_id(raw: &str, field: &str) -> Result<Uuid, ApiError> {
    raw.trim().parse::<Uuid>().map_err(|_| {
        validation_error(
            "Invalid identifier",
            serde_json::json!({ field: "Must be a valid UUID" }),
        )
    })
}

pub(crate) fn query_rejection(rejection: QueryRejection) -> ApiError {
    validation_error(
        "Invalid query parameters",
        serde_json::json!({ "query": rejection.body_text() }),
    )
}

pub(crate) fn page_size(limit: Option<u64>) -> Result<u64, ApiError> {
    match limit {
        None => Ok(DEFAULT_PAGE_SIZE),
        Some(0) => Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": "Minimum allowed limit is 1" }),
        )),
        Some(limit) if limit > MAX_PAGE_SIZE => Err(validation_error(
            "Invalid limit",
            serde_json::json!({ "limit": format!("Maximum allowed limit is {MAX_PAGE_SIZE}") }),
        )),
        Some(limit) => Ok(limit),
    }
}

pub(crate) fn utc(at: DateTimeWithTimeZone) -> DateTime<Utc> {
    at.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_bounds() {
        assert_eq!(page_size(None).unwrap(), DEFAULT_PAGE_SIZE);
        assert_eq!(page_size(Some(10)).unwrap(), 10);
        assert!(page_size(Some(0)).is_err());
        assert!(page_size(Some(MAX_PAGE_SIZE + 1)).is_err());
    }

    #[test]
    fn parse_id_reports_field() {
        let error = parse_id("not-a-uuid", "jobId").unwrap_err();
        assert_eq!(error.code, Box::from("VALIDATION_FAILED"));
        assert_eq!(
            error.details.unwrap()["jobId"],
            serde_json::json!("Must be a valid UUID")
        );
        assert_eq!(parse_id(&Uuid::nil().to_string(), "jobId").unwrap(), Uuid::nil());
    }
}
