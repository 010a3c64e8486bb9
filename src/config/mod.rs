//! Configuration loading for the EHR sync engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `EHR_SYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::enums::{ConflictSide, ConflictStrategy, parse_enum};

const ENV_PREFIX: &str = "EHR_SYNC_";

/// Application configuration derived from `EHR_SYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<Vec<u8>>,
    #[serde(default)]
    pub queues: QueuesConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub conflicts: ConflictPolicyConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Worker pool, retry and retention settings for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct QueueSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Random extra delay as a fraction of the computed backoff
    pub jitter_factor: f64,
    pub keep_completed: usize,
    pub keep_completed_age_seconds: u64,
    pub keep_failed: usize,
    pub keep_failed_age_seconds: u64,
}

impl QueueSettings {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 300_000,
            jitter_factor: 0.1,
            keep_completed: 100,
            keep_completed_age_seconds: 3_600,
            keep_failed: 500,
            keep_failed_age_seconds: 7 * 86_400,
        }
    }

    pub fn validate(&self, queue: &str) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > 256 {
            return Err(ConfigError::InvalidQueueConcurrency {
                queue: queue.to_string(),
                value: self.concurrency,
            });
        }
        if self.max_attempts == 0 || self.max_attempts > 50 {
            return Err(ConfigError::InvalidQueueMaxAttempts {
                queue: queue.to_string(),
                value: self.max_attempts,
            });
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidQueueBackoff {
                queue: queue.to_string(),
                base: self.backoff_base_ms,
                max: self.backoff_max_ms,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidQueueJitter {
                queue: queue.to_string(),
                value: self.jitter_factor,
            });
        }
        Ok(())
    }
}

/// Settings for the four independent job queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct QueuesConfig {
    pub sync_jobs: QueueSettings,
    pub webhooks: QueueSettings,
    pub conflicts: QueueSettings,
    pub transformations: QueueSettings,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            sync_jobs: QueueSettings::with_concurrency(5),
            webhooks: QueueSettings::with_concurrency(10),
            conflicts: QueueSettings::with_concurrency(3),
            transformations: QueueSettings::with_concurrency(10),
        }
    }
}

impl QueuesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync_jobs.validate("sync-jobs")?;
        self.webhooks.validate("webhooks")?;
        self.conflicts.validate("conflicts")?;
        self.transformations.validate("transformations")?;
        Ok(())
    }
}

/// Orchestrator timeouts, failure thresholds and retention windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct OrchestratorConfig {
    /// Whole-attempt execution budget
    #[serde(default = "default_job_timeout_seconds")]
    pub job_timeout_seconds: u64,
    /// Budget for a single adapter pull or push
    #[serde(default = "default_adapter_timeout_seconds")]
    pub adapter_timeout_seconds: u64,
    /// Abort the job once this fraction of records has failed
    #[serde(default = "default_max_record_failure_rate")]
    pub max_record_failure_rate: f64,
    /// Abort the job once this many records have failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_record_failures: Option<u32>,
    /// Minimum processed records before the failure rate is evaluated
    #[serde(default = "default_failure_rate_min_records")]
    pub failure_rate_min_records: u32,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_completed_retention_days")]
    pub completed_retention_days: u64,
    #[serde(default = "default_failed_retention_days")]
    pub failed_retention_days: u64,
    #[serde(default = "default_maintenance_interval_seconds")]
    pub maintenance_interval_seconds: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_timeout_seconds: default_job_timeout_seconds(),
            adapter_timeout_seconds: default_adapter_timeout_seconds(),
            max_record_failure_rate: default_max_record_failure_rate(),
            max_record_failures: None,
            failure_rate_min_records: default_failure_rate_min_records(),
            default_max_attempts: default_max_attempts(),
            completed_retention_days: default_completed_retention_days(),
            failed_retention_days: default_failed_retention_days(),
            maintenance_interval_seconds: default_maintenance_interval_seconds(),
        }
    }
}

impl OrchestratorConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_secs(self.adapter_timeout_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_timeout_seconds == 0 {
            return Err(ConfigError::InvalidJobTimeout {
                value: self.job_timeout_seconds,
            });
        }
        if self.adapter_timeout_seconds == 0
            || self.adapter_timeout_seconds > self.job_timeout_seconds
        {
            return Err(ConfigError::InvalidAdapterTimeout {
                value: self.adapter_timeout_seconds,
                job_timeout: self.job_timeout_seconds,
            });
        }
        if !(0.0..=1.0).contains(&self.max_record_failure_rate) {
            return Err(ConfigError::InvalidFailureRate {
                value: self.max_record_failure_rate,
            });
        }
        if self.default_max_attempts == 0 || self.default_max_attempts > 50 {
            return Err(ConfigError::InvalidMaxAttempts {
                value: self.default_max_attempts,
            });
        }
        if self.completed_retention_days > self.failed_retention_days {
            return Err(ConfigError::InvalidRetentionWindows {
                completed: self.completed_retention_days,
                failed: self.failed_retention_days,
            });
        }
        Ok(())
    }
}

/// Conflict strategy policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ConflictPolicyConfig {
    pub default_strategy: ConflictStrategy,
    /// Side that wins under source-priority (and LWW ties)
    pub source_priority: ConflictSide,
    /// Per resource type strategy, e.g. `Observation -> FIELD_LEVEL_MERGE`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_strategies: BTreeMap<String, ConflictStrategy>,
    /// Resource types whose conflicts always go to manual review
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual_review_resource_types: Vec<String>,
}

impl Default for ConflictPolicyConfig {
    fn default() -> Self {
        Self {
            default_strategy: ConflictStrategy::LastWriteWins,
            source_priority: ConflictSide::Remote,
            resource_strategies: BTreeMap::new(),
            manual_review_resource_types: Vec::new(),
        }
    }
}

/// Webhook ingestion and delivery defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WebhooksConfig {
    /// Identical payloads within this window are rejected as replays
    pub replay_window_seconds: u64,
    pub max_body_kb: usize,
    pub default_retry_attempts: u32,
    pub default_retry_delay_ms: u64,
    pub default_timeout_ms: u64,
    pub user_agent: String,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            replay_window_seconds: 300,
            max_body_kb: 512,
            default_retry_attempts: 3,
            default_retry_delay_ms: 1_000,
            default_timeout_ms: 10_000,
            user_agent: format!("ehr-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl WebhooksConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replay_window_seconds == 0 {
            return Err(ConfigError::InvalidReplayWindow {
                value: self.replay_window_seconds,
            });
        }
        if self.max_body_kb == 0 {
            return Err(ConfigError::InvalidWebhookBodyLimit {
                value: self.max_body_kb,
            });
        }
        Ok(())
    }
}

/// Scheduler-specific configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sync_scheduler_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    #[serde(default = "default_sync_scheduler_default_interval_seconds")]
    pub default_interval_seconds: u64,
    #[serde(default = "default_sync_scheduler_jitter_pct_min")]
    pub jitter_pct_min: f64,
    #[serde(default = "default_sync_scheduler_jitter_pct_max")]
    pub jitter_pct_max: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_seconds: default_sync_scheduler_tick_interval_seconds(),
            default_interval_seconds: default_sync_scheduler_default_interval_seconds(),
            jitter_pct_min: default_sync_scheduler_jitter_pct_min(),
            jitter_pct_max: default_sync_scheduler_jitter_pct_max(),
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_seconds < 10 || self.tick_interval_seconds > 300 {
            return Err(ConfigError::InvalidSchedulerTickInterval {
                value: self.tick_interval_seconds,
            });
        }

        if self.default_interval_seconds < 60 {
            return Err(ConfigError::InvalidSchedulerDefaultInterval {
                value: self.default_interval_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_pct_min) {
            return Err(ConfigError::InvalidSchedulerJitterRange {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
                field: "minimum percentage".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_pct_max) {
            return Err(ConfigError::InvalidSchedulerJitterRange {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
                field: "maximum percentage".to_string(),
            });
        }

        if self.jitter_pct_min > self.jitter_pct_max {
            return Err(ConfigError::InvalidSchedulerJitterInverted {
                min: self.jitter_pct_min,
                max: self.jitter_pct_max,
            });
        }

        Ok(())
    }
}

/// Per-vendor adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ProvidersConfig {
    /// Base FHIR URL per provider slug; a connection's own `base_url` wins
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub base_urls: BTreeMap<String, String>,
    /// Maximum bundle pages followed per resource type in one pull
    pub max_pages: u32,
    pub user_agent: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            base_urls: BTreeMap::new(),
            max_pages: 20,
            user_agent: format!("ehr-sync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProvidersConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (provider, base_url) in &self.base_urls {
            if url::Url::parse(base_url).is_err() {
                return Err(ConfigError::InvalidProviderBaseUrl {
                    provider: provider.clone(),
                    value: base_url.clone(),
                });
            }
        }
        if self.max_pages == 0 {
            return Err(ConfigError::InvalidProviderMaxPages {
                value: self.max_pages,
            });
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            crypto_key: None,
            queues: QueuesConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            conflicts: ConflictPolicyConfig::default(),
            webhooks: WebhooksConfig::default(),
            scheduler: SchedulerConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec!["[REDACTED]".to_string()];
        }
        if config.crypto_key.is_some() {
            config.crypto_key = Some(b"[REDACTED]".to_vec());
        }
        if let Ok(mut url) = url::Url::parse(&config.database_url)
            && url.password().is_some()
            && url.set_password(Some("[REDACTED]")).is_ok()
        {
            config.database_url = url.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.crypto_key {
            Some(ref key) if key.len() != 32 => {
                return Err(ConfigError::InvalidCryptoKeyLength { length: key.len() });
            }
            Some(_) => {}
            None => return Err(ConfigError::MissingCryptoKey),
        }

        if self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        self.queues.validate()?;
        self.orchestrator.validate()?;
        self.webhooks.validate()?;
        self.scheduler.validate()?;
        self.providers.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://ehr_sync@localhost:5432/ehr_sync".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_job_timeout_seconds() -> u64 {
    300 // 5 minutes
}

fn default_adapter_timeout_seconds() -> u64 {
    30
}

fn default_max_record_failure_rate() -> f64 {
    0.5
}

fn default_failure_rate_min_records() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_completed_retention_days() -> u64 {
    7
}

fn default_failed_retention_days() -> u64 {
    30
}

fn default_maintenance_interval_seconds() -> u64 {
    3600 // 1 hour
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_sync_scheduler_tick_interval_seconds() -> u64 {
    60 // 1 minute
}

fn default_sync_scheduler_default_interval_seconds() -> u64 {
    900 // 15 minutes
}

fn default_sync_scheduler_jitter_pct_min() -> f64 {
    0.0
}

fn default_sync_scheduler_jitter_pct_max() -> f64 {
    0.2
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set EHR_SYNC_OPERATOR_TOKEN or EHR_SYNC_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("crypto key is missing; set EHR_SYNC_CRYPTO_KEY environment variable")]
    MissingCryptoKey,
    #[error("crypto key is invalid base64: {error}")]
    InvalidCryptoKeyBase64 { error: String },
    #[error("crypto key must decode to exactly 32 bytes, got {length} bytes")]
    InvalidCryptoKeyLength { length: usize },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("queue {queue} concurrency must be between 1 and 256, got {value}")]
    InvalidQueueConcurrency { queue: String, value: usize },
    #[error("queue {queue} max attempts must be between 1 and 50, got {value}")]
    InvalidQueueMaxAttempts { queue: String, value: u32 },
    #[error("queue {queue} backoff base ({base}ms) must be positive and not exceed max ({max}ms)")]
    InvalidQueueBackoff { queue: String, base: u64, max: u64 },
    #[error("queue {queue} jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidQueueJitter { queue: String, value: f64 },
    #[error("job timeout must be positive, got {value}")]
    InvalidJobTimeout { value: u64 },
    #[error("adapter timeout must be positive and not exceed the job timeout ({job_timeout}s), got {value}")]
    InvalidAdapterTimeout { value: u64, job_timeout: u64 },
    #[error("record failure rate must be between 0.0 and 1.0, got {value}")]
    InvalidFailureRate { value: f64 },
    #[error("default max attempts must be between 1 and 50, got {value}")]
    InvalidMaxAttempts { value: u32 },
    #[error(
        "completed retention ({completed} days) cannot exceed failed retention ({failed} days)"
    )]
    InvalidRetentionWindows { completed: u64, failed: u64 },
    #[error("webhook replay window must be positive, got {value}")]
    InvalidReplayWindow { value: u64 },
    #[error("webhook max body size must be positive, got {value}KB")]
    InvalidWebhookBodyLimit { value: usize },
    #[error("sync scheduler tick interval must be between 10 and 300 seconds, got {value}")]
    InvalidSchedulerTickInterval { value: u64 },
    #[error("sync scheduler default interval must be at least 60 seconds, got {value}")]
    InvalidSchedulerDefaultInterval { value: u64 },
    #[error("sync scheduler jitter percentage {field} is out of bounds (min: {min}, max: {max})")]
    InvalidSchedulerJitterRange { min: f64, max: f64, field: String },
    #[error(
        "sync scheduler jitter percentage minimum ({min}) cannot be greater than maximum ({max})"
    )]
    InvalidSchedulerJitterInverted { min: f64, max: f64 },
    #[error("provider {provider} base url '{value}' is not a valid URL")]
    InvalidProviderBaseUrl { provider: String, value: String },
    #[error("provider max pages must be positive, got {value}")]
    InvalidProviderMaxPages { value: u32 },
}

/// Loads configuration using layered `.env` files and `EHR_SYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);

        // Support both a single token and a comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            split_list(&tokens)
        } else if let Some(token) = layered.remove("OPERATOR_TOKEN") {
            vec![token]
        } else {
            Vec::new()
        };

        let crypto_key = match layered.remove("CRYPTO_KEY") {
            Some(key_str) => {
                use base64::{Engine as _, engine::general_purpose};
                Some(general_purpose::STANDARD.decode(key_str.trim()).map_err(|e| {
                    ConfigError::InvalidCryptoKeyBase64 {
                        error: e.to_string(),
                    }
                })?)
            }
            None => None,
        };

        let queues = QueuesConfig {
            sync_jobs: queue_settings(&mut layered, "SYNC_JOBS", QueueSettings::with_concurrency(5)),
            webhooks: queue_settings(&mut layered, "WEBHOOKS", QueueSettings::with_concurrency(10)),
            conflicts: queue_settings(&mut layered, "CONFLICTS", QueueSettings::with_concurrency(3)),
            transformations: queue_settings(
                &mut layered,
                "TRANSFORMATIONS",
                QueueSettings::with_concurrency(10),
            ),
        };

        let orchestrator = OrchestratorConfig {
            job_timeout_seconds: layered
                .remove("JOB_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_job_timeout_seconds),
            adapter_timeout_seconds: layered
                .remove("ADAPTER_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_adapter_timeout_seconds),
            max_record_failure_rate: layered
                .remove("MAX_RECORD_FAILURE_RATE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_record_failure_rate),
            max_record_failures: layered
                .remove("MAX_RECORD_FAILURES")
                .and_then(|v| v.parse().ok()),
            failure_rate_min_records: layered
                .remove("FAILURE_RATE_MIN_RECORDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_failure_rate_min_records),
            default_max_attempts: layered
                .remove("DEFAULT_MAX_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_attempts),
            completed_retention_days: layered
                .remove("COMPLETED_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_completed_retention_days),
            failed_retention_days: layered
                .remove("FAILED_RETENTION_DAYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_failed_retention_days),
            maintenance_interval_seconds: layered
                .remove("MAINTENANCE_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_maintenance_interval_seconds),
        };

        let conflicts = parse_conflict_policy(&mut layered)?;

        let webhook_defaults = WebhooksConfig::default();
        let webhooks = WebhooksConfig {
            replay_window_seconds: layered
                .remove("WEBHOOK_REPLAY_WINDOW_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(webhook_defaults.replay_window_seconds),
            max_body_kb: layered
                .remove("WEBHOOK_MAX_BODY_KB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(webhook_defaults.max_body_kb),
            default_retry_attempts: layered
                .remove("WEBHOOK_DEFAULT_RETRY_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(webhook_defaults.default_retry_attempts),
            default_retry_delay_ms: layered
                .remove("WEBHOOK_DEFAULT_RETRY_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(webhook_defaults.default_retry_delay_ms),
            default_timeout_ms: layered
                .remove("WEBHOOK_DEFAULT_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(webhook_defaults.default_timeout_ms),
            user_agent: layered
                .remove("WEBHOOK_USER_AGENT")
                .filter(|v| !v.is_empty())
                .unwrap_or(webhook_defaults.user_agent),
        };

        let scheduler = SchedulerConfig {
            enabled: layered
                .remove("SYNC_SCHEDULER_ENABLED")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_enabled),
            tick_interval_seconds: layered
                .remove("SYNC_SCHEDULER_TICK_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_scheduler_tick_interval_seconds),
            default_interval_seconds: layered
                .remove("SYNC_SCHEDULER_DEFAULT_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_scheduler_default_interval_seconds),
            jitter_pct_min: layered
                .remove("SYNC_SCHEDULER_JITTER_PCT_MIN")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_scheduler_jitter_pct_min),
            jitter_pct_max: layered
                .remove("SYNC_SCHEDULER_JITTER_PCT_MAX")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_sync_scheduler_jitter_pct_max),
        };

        let providers = parse_providers(&mut layered);

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            crypto_key,
            queues,
            orchestrator,
            conflicts,
            webhooks,
            scheduler,
            providers,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reads `QUEUE_<NAME>_<SETTING>` keys on top of `defaults`.
fn queue_settings(
    layered: &mut BTreeMap<String, String>,
    name: &str,
    defaults: QueueSettings,
) -> QueueSettings {
    let mut take = |setting: &str| layered.remove(&format!("QUEUE_{name}_{setting}"));

    QueueSettings {
        concurrency: take("CONCURRENCY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.concurrency),
        max_attempts: take("MAX_ATTEMPTS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts),
        backoff_base_ms: take("BACKOFF_BASE_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.backoff_base_ms),
        backoff_max_ms: take("BACKOFF_MAX_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.backoff_max_ms),
        jitter_factor: take("JITTER_FACTOR")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.jitter_factor),
        keep_completed: take("KEEP_COMPLETED")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.keep_completed),
        keep_completed_age_seconds: take("KEEP_COMPLETED_AGE_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.keep_completed_age_seconds),
        keep_failed: take("KEEP_FAILED")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.keep_failed),
        keep_failed_age_seconds: take("KEEP_FAILED_AGE_SECONDS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.keep_failed_age_seconds),
    }
}

/// Strategy values are enum names; resource strategies are `Type:STRATEGY` pairs.
fn parse_conflict_policy(
    layered: &mut BTreeMap<String, String>,
) -> Result<ConflictPolicyConfig, ConfigError> {
    let mut policy = ConflictPolicyConfig::default();

    if let Some(raw) = layered.remove("CONFLICT_DEFAULT_STRATEGY") {
        policy.default_strategy =
            parse_enum(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}CONFLICT_DEFAULT_STRATEGY"),
                value: raw.clone(),
            })?;
    }

    if let Some(raw) = layered.remove("CONFLICT_SOURCE_PRIORITY") {
        policy.source_priority = parse_enum(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}CONFLICT_SOURCE_PRIORITY"),
            value: raw.clone(),
        })?;
    }

    if let Some(raw) = layered.remove("CONFLICT_RESOURCE_STRATEGIES") {
        for pair in split_list(&raw) {
            let parsed = pair.split_once(':').and_then(|(resource_type, strategy)| {
                parse_enum::<ConflictStrategy>(strategy)
                    .map(|strategy| (resource_type.trim().to_string(), strategy))
            });
            match parsed {
                Some((resource_type, strategy)) if !resource_type.is_empty() => {
                    policy.resource_strategies.insert(resource_type, strategy);
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("{ENV_PREFIX}CONFLICT_RESOURCE_STRATEGIES"),
                        value: pair,
                    });
                }
            }
        }
    }

    if let Some(raw) = layered.remove("CONFLICT_MANUAL_REVIEW_RESOURCE_TYPES") {
        policy.manual_review_resource_types = split_list(&raw);
    }

    Ok(policy)
}

/// Collects `PROVIDER_<SLUG>_BASE_URL` entries plus shared adapter settings.
fn parse_providers(layered: &mut BTreeMap<String, String>) -> ProvidersConfig {
    let mut providers = ProvidersConfig::default();

    let keys: Vec<String> = layered
        .keys()
        .filter(|key| key.starts_with("PROVIDER_") && key.ends_with("_BASE_URL"))
        .cloned()
        .collect();
    for key in keys {
        if let Some(value) = layered.remove(&key) {
            let slug = key
                .trim_start_matches("PROVIDER_")
                .trim_end_matches("_BASE_URL")
                .to_ascii_lowercase();
            if !slug.is_empty() && !value.is_empty() {
                providers.base_urls.insert(slug, value);
            }
        }
    }

    if let Some(max_pages) = layered
        .remove("PROVIDER_MAX_PAGES")
        .and_then(|v| v.parse().ok())
    {
        providers.max_pages = max_pages;
    }
    if let Some(user_agent) = layered.remove("PROVIDER_USER_AGENT").filter(|v| !v.is_empty()) {
        providers.user_agent = user_agent;
    }

    providers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        AppConfig {
            operator_tokens: vec!["token".to_string()],
            crypto_key: Some(vec![7u8; 32]),
            ..AppConfig::default()
        }
    }

    #[test]
    fn default_queue_concurrency_matches_queue_roles() {
        let queues = QueuesConfig::default();
        assert_eq!(queues.sync_jobs.concurrency, 5);
        assert_eq!(queues.webhooks.concurrency, 10);
        assert_eq!(queues.conflicts.concurrency, 3);
        assert_eq!(queues.transformations.concurrency, 10);
    }

    #[test]
    fn validate_requires_crypto_key_and_tokens() {
        assert!(valid_config().validate().is_ok());

        let mut missing_key = valid_config();
        missing_key.crypto_key = None;
        assert!(matches!(
            missing_key.validate(),
            Err(ConfigError::MissingCryptoKey)
        ));

        let mut short_key = valid_config();
        short_key.crypto_key = Some(vec![1u8; 16]);
        assert!(matches!(
            short_key.validate(),
            Err(ConfigError::InvalidCryptoKeyLength { length: 16 })
        ));

        let mut no_tokens = valid_config();
        no_tokens.operator_tokens.clear();
        assert!(matches!(
            no_tokens.validate(),
            Err(ConfigError::MissingOperatorTokens)
        ));
    }

    #[test]
    fn queue_backoff_bounds_are_checked() {
        let mut config = valid_config();
        config.queues.conflicts.backoff_base_ms = 10_000;
        config.queues.conflicts.backoff_max_ms = 1_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidQueueBackoff { ref queue, .. }) if queue == "conflicts"
        ));
    }

    #[test]
    fn adapter_timeout_cannot_exceed_job_timeout() {
        let mut config = valid_config();
        config.orchestrator.job_timeout_seconds = 10;
        config.orchestrator.adapter_timeout_seconds = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    fn conflict_policy_parses_resource_pairs() {
        let mut layered = BTreeMap::new();
        layered.insert(
            "CONFLICT_RESOURCE_STRATEGIES".to_string(),
            "Observation:field_level_merge, Patient:MANUAL_REVIEW".to_string(),
        );
        layered.insert(
            "CONFLICT_SOURCE_PRIORITY".to_string(),
            "local".to_string(),
        );

        let policy = parse_conflict_policy(&mut layered).unwrap();
        assert_eq!(
            policy.resource_strategies.get("Observation"),
            Some(&ConflictStrategy::FieldLevelMerge)
        );
        assert_eq!(
            policy.resource_strategies.get("Patient"),
            Some(&ConflictStrategy::ManualReview)
        );
        assert_eq!(policy.source_priority, ConflictSide::Local);
        assert_eq!(policy.default_strategy, ConflictStrategy::LastWriteWins);
    }

    #[test]
    fn conflict_policy_rejects_unknown_strategy() {
        let mut layered = BTreeMap::new();
        layered.insert(
            "CONFLICT_DEFAULT_STRATEGY".to_string(),
            "coin_flip".to_string(),
        );
        assert!(matches!(
            parse_conflict_policy(&mut layered),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn provider_base_urls_are_keyed_by_lowercase_slug() {
        let mut layered = BTreeMap::new();
        layered.insert(
            "PROVIDER_EPIC_BASE_URL".to_string(),
            "https://fhir.epic.example/api/FHIR/R4".to_string(),
        );
        layered.insert("PROVIDER_MAX_PAGES".to_string(), "5".to_string());

        let providers = parse_providers(&mut layered);
        assert_eq!(
            providers.base_urls.get("epic").map(String::as_str),
            Some("https://fhir.epic.example/api/FHIR/R4")
        );
        assert_eq!(providers.max_pages, 5);
        assert!(layered.is_empty());
    }

    #[test]
    fn redacted_json_hides_secrets() {
        let mut config = valid_config();
        config.database_url = "postgresql://user:hunter2@db:5432/ehr".to_string();
        let json = config.redacted_json().unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("\"token\""));
        assert!(json.contains("[REDACTED]"));
    }
}
