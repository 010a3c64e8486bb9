//! # Provider Adapters
//!
//! Every EHR vendor is reached through a [`ProviderAdapter`]: pull records,
//! push records, verify webhook signatures. The engine never knows which
//! vendor it is talking to; it looks the adapter up by provider slug in the
//! [`AdapterRegistry`].

pub mod fhir;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::collaborators::ActiveConnection;
use crate::config::ProvidersConfig;
use crate::error::SyncFailure;
use crate::models::enums::{FailureKind, JobType, SignatureAlgorithm};
use crate::webhooks::verification;

pub use fhir::{FhirRestAdapter, VENDOR_PROFILES, VendorProfile};

/// What to pull.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub job_type: JobType,
    pub resource_types: Vec<String>,
    pub patient_id: Option<String>,
    /// Required for SINGLE_RESOURCE pulls
    pub resource_id: Option<String>,
    /// Only records modified after this instant (INCREMENTAL)
    pub since: Option<DateTime<Utc>>,
}

/// One provider-side resource, untransformed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRecord {
    pub resource_type: String,
    pub resource_id: String,
    pub data: JsonValue,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullResult {
    pub records: Vec<ProviderRecord>,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushResult {
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    #[error("provider returned HTTP {status}")]
    Http { status: u16, body: Option<String> },
    #[error("network error: {0}")]
    Network(String),
    #[error("provider call timed out")]
    Timeout,
    #[error("provider rejected the connection credentials")]
    Unauthorized,
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<u64> },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("adapter misconfigured: {0}")]
    Configuration(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl AdapterError {
    /// Classifies the error into the engine's failure taxonomy.
    pub fn into_failure(self) -> SyncFailure {
        let message = self.to_string();
        match self {
            AdapterError::Http { status, .. } if status >= 500 => {
                SyncFailure::new(FailureKind::Connection, message)
            }
            AdapterError::Http { .. } => SyncFailure::fatal(FailureKind::Validation, message),
            AdapterError::Network(_) | AdapterError::RateLimited { .. } => {
                SyncFailure::new(FailureKind::Connection, message)
            }
            AdapterError::Timeout => SyncFailure::timeout(message),
            AdapterError::Unauthorized => SyncFailure::fatal(FailureKind::Connection, message),
            AdapterError::Malformed(_)
            | AdapterError::Configuration(_)
            | AdapterError::Unsupported(_) => SyncFailure::fatal(FailureKind::Validation, message),
        }
    }
}

impl From<AdapterError> for SyncFailure {
    fn from(error: AdapterError) -> Self {
        error.into_failure()
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider slug this adapter serves.
    fn provider(&self) -> &str;

    async fn pull(
        &self,
        connection: &ActiveConnection,
        request: &PullRequest,
    ) -> Result<PullResult, AdapterError>;

    async fn push(
        &self,
        connection: &ActiveConnection,
        record: &ProviderRecord,
    ) -> Result<PushResult, AdapterError>;

    /// Constant-time HMAC check of `signature` over the raw payload.
    fn verify_webhook(
        &self,
        secret: &[u8],
        algorithm: SignatureAlgorithm,
        payload: &[u8],
        signature: &str,
    ) -> bool {
        verification::verify_signature(secret, algorithm, payload, signature)
    }
}

/// Adapter lookup by provider slug.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the FHIR REST adapter for every known vendor profile.
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AdapterError::Configuration(e.to_string()))?;

        let mut registry = Self::new();
        for profile in VENDOR_PROFILES {
            let base_url = config.base_urls.get(profile.slug).cloned();
            registry.register(Arc::new(FhirRestAdapter::new(
                *profile,
                client.clone(),
                base_url,
                config.max_pages,
            )));
        }
        tracing::info!(providers = ?registry.providers(), "Registered provider adapters");
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider().to_string(), adapter);
    }

    pub fn get(&self, provider_slug: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_slug).cloned()
    }

    /// Registered slugs, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.adapters.keys().cloned().collect();
        slugs.sort();
        slugs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_errors_map_to_failure_kinds() {
        let server = AdapterError::Http {
            status: 503,
            body: None,
        }
        .into_failure();
        assert_eq!(server.kind, FailureKind::Connection);
        assert!(server.retryable);

        let not_found = AdapterError::Http {
            status: 404,
            body: None,
        }
        .into_failure();
        assert_eq!(not_found.kind, FailureKind::Validation);
        assert!(!not_found.retryable);

        let timeout = AdapterError::Timeout.into_failure();
        assert_eq!(timeout.kind, FailureKind::Timeout);
        assert!(timeout.retryable);

        let unauthorized = AdapterError::Unauthorized.into_failure();
        assert_eq!(unauthorized.kind, FailureKind::Connection);
        assert!(!unauthorized.retryable);
    }

    #[test]
    fn registry_covers_all_vendor_profiles() {
        let registry = AdapterRegistry::from_config(&ProvidersConfig::default()).unwrap();
        for profile in VENDOR_PROFILES {
            assert!(registry.get(profile.slug).is_some(), "{}", profile.slug);
        }
        assert!(registry.get("unknown-vendor").is_none());
    }
}
