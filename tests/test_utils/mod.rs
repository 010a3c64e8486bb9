//! Shared fixtures for integration tests: an in-memory SQLite database with
//! migrations applied, seeded connections, and a scripted provider adapter.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ehr_sync::adapters::{
    AdapterError, AdapterRegistry, ProviderAdapter, ProviderRecord, PullRequest, PullResult,
    PushResult,
};
use ehr_sync::collaborators::{ActiveConnection, Collaborators};
use ehr_sync::config::AppConfig;
use ehr_sync::engine::Engine;
use ehr_sync::models::connection;
use ehr_sync::models::enums::{ConnectionStatus, SyncDirection};
use ehr_sync::repositories::{CanonicalRecordRepository, ConnectionRepository};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Set, Statement};
use serde_json::{Value as JsonValue, json};
use uuid::Uuid;

pub const OPERATOR_TOKEN: &str = "test-operator-token";
pub const PROVIDER: &str = "epic";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    // Fixtures insert rows without their parent relations.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Configuration suitable for an engine that is driven by hand.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        operator_tokens: vec![OPERATOR_TOKEN.to_string()],
        crypto_key: Some(vec![7u8; 32]),
        ..AppConfig::default()
    };
    config.scheduler.enabled = false;
    config
}

/// Inserts an ACTIVE connection served by [`PROVIDER`].
pub async fn insert_connection(
    db: &DatabaseConnection,
    permitted: &[&str],
    direction: SyncDirection,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    let now = Utc::now().fixed_offset();
    ConnectionRepository::new(db.clone())
        .insert(connection::ActiveModel {
            id: Set(id),
            provider_slug: Set(PROVIDER.to_string()),
            display_name: Set("Epic sandbox".to_string()),
            status: Set(ConnectionStatus::Active),
            base_url: Set(None),
            credentials: Set(Some(json!({ "access_token": "provider-token" }))),
            permitted_resource_types: Set(json!(permitted)),
            sync_direction: Set(direction),
            conflict_strategy: Set(None),
            sync_interval_seconds: Set(None),
            last_synced_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        })
        .await?;
    Ok(id)
}

/// Writes a canonical record as if a previous sync had stored it.
pub async fn seed_record(
    db: &DatabaseConnection,
    connection_id: Uuid,
    resource_type: &str,
    resource_id: &str,
    data: JsonValue,
    modified_at: DateTime<Utc>,
) -> Result<()> {
    CanonicalRecordRepository::new(db.clone())
        .upsert(
            connection_id,
            resource_type,
            resource_id,
            data,
            Some(modified_at.fixed_offset()),
        )
        .await?;
    Ok(())
}

pub fn provider_record(
    resource_type: &str,
    resource_id: &str,
    data: JsonValue,
    modified_at: DateTime<Utc>,
) -> ProviderRecord {
    ProviderRecord {
        resource_type: resource_type.to_string(),
        resource_id: resource_id.to_string(),
        data,
        modified_at: Some(modified_at),
    }
}

/// Polls `check` until it holds, for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Adapter whose pull and push results are scripted per call. Once a script
/// runs out every pull returns no records and every push succeeds.
#[derive(Default)]
pub struct MockAdapter {
    pulls: Mutex<VecDeque<Result<PullResult, AdapterError>>>,
    pushes: Mutex<VecDeque<Result<PushResult, AdapterError>>>,
    pushed: Mutex<Vec<ProviderRecord>>,
    pull_calls: Mutex<usize>,
    pull_delay: Mutex<Duration>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_pull(&self, result: Result<PullResult, AdapterError>) {
        self.pulls.lock().unwrap().push_back(result);
    }

    pub fn script_records(&self, records: Vec<ProviderRecord>) {
        self.script_pull(Ok(PullResult {
            records,
            bytes_transferred: 256,
        }));
    }

    pub fn script_push(&self, result: Result<PushResult, AdapterError>) {
        self.pushes.lock().unwrap().push_back(result);
    }

    /// Every later pull sleeps for `delay` before answering.
    pub fn delay_pulls(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = delay;
    }

    pub fn pull_calls(&self) -> usize {
        *self.pull_calls.lock().unwrap()
    }

    pub fn pushed(&self) -> Vec<ProviderRecord> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> &str {
        PROVIDER
    }

    async fn pull(
        &self,
        _connection: &ActiveConnection,
        _request: &PullRequest,
    ) -> Result<PullResult, AdapterError> {
        *self.pull_calls.lock().unwrap() += 1;
        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.pulls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(PullResult::default()))
    }

    async fn push(
        &self,
        _connection: &ActiveConnection,
        record: &ProviderRecord,
    ) -> Result<PushResult, AdapterError> {
        let scripted = self.pushes.lock().unwrap().pop_front();
        if let Some(Err(error)) = scripted {
            return Err(error);
        }
        self.pushed.lock().unwrap().push(record.clone());
        scripted.unwrap_or(Ok(PushResult {
            bytes_transferred: 128,
        }))
    }
}

/// Engine wired to the database and `adapter`. Queue workers are not
/// started; tests drive the orchestrator directly.
pub fn build_engine(db: &DatabaseConnection, adapter: Arc<MockAdapter>) -> Result<Arc<Engine>> {
    build_engine_with_config(db, adapter, test_config())
}

pub fn build_engine_with_config(
    db: &DatabaseConnection,
    adapter: Arc<MockAdapter>,
    config: AppConfig,
) -> Result<Arc<Engine>> {
    let mut adapters = AdapterRegistry::new();
    adapters.register(adapter);
    let engine = Engine::with_parts(config, db.clone(), Collaborators::database(db), adapters)?;
    Ok(Arc::new(engine))
}
