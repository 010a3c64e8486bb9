//! Enumerations persisted as text columns.
//!
//! Every enum serializes to the same SCREAMING_SNAKE_CASE string it is stored
//! under, so API payloads, database rows and log fields all agree.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Parse any string-backed active enum case-insensitively.
pub fn parse_enum<E>(raw: &str) -> Option<E>
where
    E: ActiveEnum<Value = String>,
{
    E::try_from_value(&raw.trim().to_ascii_uppercase()).ok()
}

/// Kind of sync run requested.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[sea_orm(string_value = "FULL")]
    Full,
    #[sea_orm(string_value = "INCREMENTAL")]
    Incremental,
    #[sea_orm(string_value = "SINGLE_RESOURCE")]
    SingleResource,
}

/// Which way records travel during a sync.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncDirection {
    #[sea_orm(string_value = "INBOUND")]
    Inbound,
    #[sea_orm(string_value = "OUTBOUND")]
    Outbound,
    #[sea_orm(string_value = "BIDIRECTIONAL")]
    Bidirectional,
}

impl SyncDirection {
    pub fn includes_inbound(self) -> bool {
        matches!(self, SyncDirection::Inbound | SyncDirection::Bidirectional)
    }

    pub fn includes_outbound(self) -> bool {
        matches!(self, SyncDirection::Outbound | SyncDirection::Bidirectional)
    }

    /// Whether a connection configured with `self` may run a job in `requested` direction.
    pub fn permits(self, requested: SyncDirection) -> bool {
        match self {
            SyncDirection::Bidirectional => true,
            other => other == requested,
        }
    }
}

/// Lifecycle status of a sync job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "PROCESSING")]
    Processing,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "FAILED")]
    Failed,
    #[sea_orm(string_value = "RETRYING")]
    Retrying,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl JobStatus {
    /// Forward-only transition table. Nothing ever re-enters `Pending`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retrying)
                | (Processing, Cancelled)
                | (Failed, Retrying)
                | (Retrying, Processing)
                | (Retrying, Cancelled)
        )
    }
}

/// Lifecycle status of a detected conflict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    #[sea_orm(string_value = "OPEN")]
    Open,
    #[sea_orm(string_value = "AUTO_RESOLVED")]
    AutoResolved,
    #[sea_orm(string_value = "RESOLVED")]
    Resolved,
    #[sea_orm(string_value = "IGNORED")]
    Ignored,
}

/// Automatic resolution strategy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    #[sea_orm(string_value = "LAST_WRITE_WINS")]
    LastWriteWins,
    #[sea_orm(string_value = "SOURCE_PRIORITY")]
    SourcePriority,
    #[sea_orm(string_value = "FIELD_LEVEL_MERGE")]
    FieldLevelMerge,
    #[sea_orm(string_value = "MANUAL_REVIEW")]
    ManualReview,
}

/// Side of a conflict: the platform's canonical copy or the provider's copy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSide {
    #[sea_orm(string_value = "LOCAL")]
    Local,
    #[sea_orm(string_value = "REMOTE")]
    Remote,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    #[sea_orm(string_value = "WARNING")]
    Warning,
    #[sea_orm(string_value = "ERROR")]
    Error,
    #[sea_orm(string_value = "CRITICAL")]
    Critical,
}

/// Failure taxonomy shared by jobs, records and webhook deliveries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    #[sea_orm(string_value = "VALIDATION")]
    Validation,
    #[sea_orm(string_value = "CONNECTION")]
    Connection,
    #[sea_orm(string_value = "TRANSFORMATION")]
    Transformation,
    #[sea_orm(string_value = "CONFLICT_UNRESOLVABLE")]
    ConflictUnresolvable,
    #[sea_orm(string_value = "TIMEOUT")]
    Timeout,
    #[sea_orm(string_value = "WEBHOOK_SIGNATURE_INVALID")]
    WebhookSignatureInvalid,
    #[sea_orm(string_value = "PERSISTENCE")]
    Persistence,
}

impl FailureKind {
    /// Default retry classification for a job-level failure of this kind.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Connection | FailureKind::Timeout | FailureKind::Persistence
        )
    }

    /// Stable error code recorded on `sync_errors.code`.
    pub fn error_code(self) -> &'static str {
        match self {
            FailureKind::Validation => "VALIDATION_FAILED",
            FailureKind::Connection => "CONNECTION_FAILED",
            FailureKind::Transformation => "TRANSFORMATION_FAILED",
            FailureKind::ConflictUnresolvable => "CONFLICT_UNRESOLVABLE",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            FailureKind::Persistence => "PERSISTENCE_FAILED",
        }
    }
}

/// HMAC digest used to sign webhook payloads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureAlgorithm {
    #[sea_orm(string_value = "SHA256")]
    Sha256,
    #[sea_orm(string_value = "SHA512")]
    Sha512,
}

impl SignatureAlgorithm {
    /// Header carrying the signature for this algorithm.
    pub fn header_name(self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256 => "x-signature-sha256",
            SignatureAlgorithm::Sha512 => "x-signature-sha512",
        }
    }

    /// Optional `algo=` prefix accepted in front of the hex digest.
    pub fn prefix(self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256 => "sha256=",
            SignatureAlgorithm::Sha512 => "sha512=",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookDirection {
    #[sea_orm(string_value = "INBOUND")]
    Inbound,
    #[sea_orm(string_value = "OUTBOUND")]
    Outbound,
}

/// Result recorded on each webhook log entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookOutcome {
    #[sea_orm(string_value = "ACCEPTED")]
    Accepted,
    #[sea_orm(string_value = "SIGNATURE_INVALID")]
    SignatureInvalid,
    #[sea_orm(string_value = "REPLAY_REJECTED")]
    ReplayRejected,
    #[sea_orm(string_value = "MALFORMED")]
    Malformed,
    #[sea_orm(string_value = "DELIVERED")]
    Delivered,
    #[sea_orm(string_value = "DELIVERY_FAILED")]
    DeliveryFailed,
    #[sea_orm(string_value = "PROCESSED")]
    Processed,
    #[sea_orm(string_value = "PROCESSING_FAILED")]
    ProcessingFailed,
    #[sea_orm(string_value = "IGNORED")]
    Ignored,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[sea_orm(string_value = "ACTIVE")]
    Active,
    #[sea_orm(string_value = "INACTIVE")]
    Inactive,
    #[sea_orm(string_value = "ERROR")]
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn job_status_never_returns_to_pending() {
        for status in JobStatus::iter() {
            assert!(!status.can_transition_to(JobStatus::Pending), "{status:?}");
        }
    }

    #[test]
    fn failed_jobs_only_move_to_retrying() {
        assert!(JobStatus::Failed.can_transition_to(JobStatus::Retrying));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Retrying));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Processing));
    }

    #[test]
    fn parse_enum_is_case_insensitive() {
        assert_eq!(
            parse_enum::<ConflictStrategy>("field_level_merge"),
            Some(ConflictStrategy::FieldLevelMerge)
        );
        assert_eq!(parse_enum::<JobStatus>(" open "), None);
        assert_eq!(parse_enum::<ConflictStatus>("open"), Some(ConflictStatus::Open));
    }

    #[test]
    fn serde_uses_stored_representation() {
        let value = serde_json::to_value(JobType::SingleResource).unwrap();
        assert_eq!(value, serde_json::json!("SINGLE_RESOURCE"));
        assert_eq!(
            JobType::SingleResource.to_value(),
            "SINGLE_RESOURCE".to_string()
        );
    }

    #[test]
    fn direction_permissions() {
        assert!(SyncDirection::Bidirectional.permits(SyncDirection::Outbound));
        assert!(SyncDirection::Inbound.permits(SyncDirection::Inbound));
        assert!(!SyncDirection::Inbound.permits(SyncDirection::Bidirectional));
    }

    #[test]
    fn only_transient_kinds_retry() {
        assert!(FailureKind::Timeout.retryable());
        assert!(FailureKind::Connection.retryable());
        assert!(!FailureKind::Validation.retryable());
        assert!(!FailureKind::WebhookSignatureInvalid.retryable());
    }
}
