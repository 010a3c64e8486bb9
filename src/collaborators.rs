//! Boundaries to systems outside the sync engine: the canonical record store,
//! the connection directory and the notification subsystem. Each is a trait so
//! tests and alternative deployments can swap the implementation; the
//! database-backed versions below are what the service wires by default.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use crate::error::SyncFailure;
use crate::models::connection;
use crate::models::enums::{ConflictStrategy, ErrorSeverity, FailureKind, SyncDirection};
use crate::repositories::{CanonicalRecordRepository, ConnectionRepository};

/// Logical key of a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub connection_id: Uuid,
    pub resource_type: String,
    pub resource_id: String,
}

impl RecordKey {
    pub fn new(
        connection_id: Uuid,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_id,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// `Type/id`, the form used in error resource references.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.resource_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub key: RecordKey,
    pub data: JsonValue,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SyncFailure {
    fn from(error: StoreError) -> Self {
        SyncFailure::new(FailureKind::Persistence, error.to_string())
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<StoredRecord>, StoreError>;

    async fn put(
        &self,
        key: &RecordKey,
        data: JsonValue,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// Records written locally after `since`, in (type, id) order.
    async fn changed_since(
        &self,
        connection_id: Uuid,
        resource_types: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredRecord>, StoreError>;
}

/// [`RecordStore`] backed by the `canonical_records` table.
#[derive(Debug, Clone)]
pub struct DbRecordStore {
    records: CanonicalRecordRepository,
}

impl DbRecordStore {
    pub fn new(records: CanonicalRecordRepository) -> Self {
        Self { records }
    }
}

fn stored(model: crate::models::canonical_record::Model) -> StoredRecord {
    StoredRecord {
        key: RecordKey::new(model.connection_id, model.resource_type, model.resource_id),
        data: model.data,
        modified_at: model.modified_at.map(|at| at.with_timezone(&Utc)),
    }
}

#[async_trait]
impl RecordStore for DbRecordStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<StoredRecord>, StoreError> {
        let model = self
            .records
            .get(key.connection_id, &key.resource_type, &key.resource_id)
            .await?;
        Ok(model.map(stored))
    }

    async fn put(
        &self,
        key: &RecordKey,
        data: JsonValue,
        modified_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.records
            .upsert(
                key.connection_id,
                &key.resource_type,
                &key.resource_id,
                data,
                modified_at.map(|at| at.fixed_offset()),
            )
            .await?;
        Ok(())
    }

    async fn changed_since(
        &self,
        connection_id: Uuid,
        resource_types: &[String],
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let models = self
            .records
            .list_changed_since(
                connection_id,
                resource_types,
                since.map(|at| at.fixed_offset()),
            )
            .await?;
        Ok(models.into_iter().map(stored).collect())
    }
}

/// The slice of a connection the engine works with.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveConnection {
    pub id: Uuid,
    pub provider_slug: String,
    pub display_name: String,
    pub base_url: Option<String>,
    pub credentials: Option<JsonValue>,
    pub permitted_resource_types: Vec<String>,
    pub sync_direction: SyncDirection,
    pub conflict_strategy: Option<ConflictStrategy>,
    pub sync_interval_seconds: Option<i64>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ActiveConnection {
    /// An empty permitted list means every resource type is allowed.
    pub fn permits_resource_type(&self, resource_type: &str) -> bool {
        self.permitted_resource_types.is_empty()
            || self
                .permitted_resource_types
                .iter()
                .any(|permitted| permitted.eq_ignore_ascii_case(resource_type))
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credentials
            .as_ref()
            .and_then(|credentials| credentials.get("access_token"))
            .and_then(JsonValue::as_str)
    }
}

impl From<connection::Model> for ActiveConnection {
    fn from(model: connection::Model) -> Self {
        let permitted_resource_types = model.permitted_types();
        Self {
            id: model.id,
            provider_slug: model.provider_slug,
            display_name: model.display_name,
            base_url: model.base_url,
            credentials: model.credentials,
            permitted_resource_types,
            sync_direction: model.sync_direction,
            conflict_strategy: model.conflict_strategy,
            sync_interval_seconds: model.sync_interval_seconds,
            last_synced_at: model.last_synced_at.map(|at| at.with_timezone(&Utc)),
        }
    }
}

#[async_trait]
pub trait ConnectionDirectory: Send + Sync {
    /// The connection if it exists and is ACTIVE.
    async fn get_active_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<ActiveConnection>, sea_orm::DbErr>;
}

#[derive(Debug, Clone)]
pub struct DbConnectionDirectory {
    connections: ConnectionRepository,
}

impl DbConnectionDirectory {
    pub fn new(connections: ConnectionRepository) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl ConnectionDirectory for DbConnectionDirectory {
    async fn get_active_connection(
        &self,
        connection_id: Uuid,
    ) -> Result<Option<ActiveConnection>, sea_orm::DbErr> {
        Ok(self
            .connections
            .find_active(connection_id)
            .await?
            .map(ActiveConnection::from))
    }
}

/// An operator-facing alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CriticalAlert {
    pub severity: ErrorSeverity,
    pub code: String,
    pub message: String,
    pub job_id: Option<Uuid>,
    pub connection_id: Option<Uuid>,
    pub webhook_config_id: Option<Uuid>,
}

/// Fire-and-forget notification sink. Implementations must not block the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: CriticalAlert);
}

/// Emits alerts as structured error logs.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: CriticalAlert) {
        tracing::error!(
            alert = true,
            code = %alert.code,
            job_id = ?alert.job_id,
            connection_id = ?alert.connection_id,
            webhook_config_id = ?alert.webhook_config_id,
            "{}",
            alert.message
        );
        metrics::counter!("operator_alerts_total", "code" => alert.code).increment(1);
    }
}

/// The external collaborators, built once and injected.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub directory: Arc<dyn ConnectionDirectory>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Database-backed store and directory with log-based alerting.
    pub fn database(db: &DatabaseConnection) -> Self {
        Self {
            store: Arc::new(DbRecordStore::new(CanonicalRecordRepository::new(db.clone()))),
            directory: Arc::new(DbConnectionDirectory::new(ConnectionRepository::new(
                db.clone(),
            ))),
            notifier: Arc::new(TracingNotifier),
        }
    }
}
