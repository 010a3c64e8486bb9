//! Payload types carried by the four engine queues.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::{
    CONFLICTS_QUEUE, Queue, QueueCounts, SYNC_JOBS_QUEUE, TRANSFORMATIONS_QUEUE, WEBHOOKS_QUEUE,
};
use crate::config::QueuesConfig;
use crate::webhooks::InboundEvent;

/// Run one attempt of a persisted sync job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJobTask {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookTask {
    /// Route a verified inbound event
    Process {
        log_id: Uuid,
        config_id: Uuid,
        /// Hash of the raw body as received
        payload_hash: String,
        event: InboundEvent,
    },
    /// POST a signed event to a subscribed endpoint
    Deliver {
        config_id: Uuid,
        delivery_id: Uuid,
        event_type: String,
        payload: JsonValue,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictTask {
    /// Push a manually resolved record back to the provider
    Propagate { conflict_id: Uuid },
}

/// A provider record delivered inline in a webhook that still needs
/// transforming and storing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformTask {
    /// Webhook config the record arrived through
    pub config_id: Uuid,
    pub payload_hash: String,
    pub connection_id: Uuid,
    pub resource_type: String,
    pub resource_id: String,
    pub record: JsonValue,
    pub modified_at: Option<DateTime<Utc>>,
}

/// The four independently configured queues, built once and shared.
#[derive(Debug, Clone)]
pub struct JobQueues {
    pub sync_jobs: Queue<SyncJobTask>,
    pub webhooks: Queue<WebhookTask>,
    pub conflicts: Queue<ConflictTask>,
    pub transformations: Queue<TransformTask>,
}

impl JobQueues {
    pub fn from_config(config: &QueuesConfig) -> Self {
        Self {
            sync_jobs: Queue::new(SYNC_JOBS_QUEUE, config.sync_jobs.clone()),
            webhooks: Queue::new(WEBHOOKS_QUEUE, config.webhooks.clone()),
            conflicts: Queue::new(CONFLICTS_QUEUE, config.conflicts.clone()),
            transformations: Queue::new(TRANSFORMATIONS_QUEUE, config.transformations.clone()),
        }
    }

    /// Counts for every queue keyed by queue name.
    pub async fn counts(&self) -> BTreeMap<&'static str, QueueCounts> {
        BTreeMap::from([
            (SYNC_JOBS_QUEUE, self.sync_jobs.counts().await),
            (WEBHOOKS_QUEUE, self.webhooks.counts().await),
            (CONFLICTS_QUEUE, self.conflicts.counts().await),
            (TRANSFORMATIONS_QUEUE, self.transformations.counts().await),
        ])
    }

    pub async fn shutdown(&self, grace: Duration) {
        tokio::join!(
            self.sync_jobs.shutdown(grace),
            self.webhooks.shutdown(grace),
            self.conflicts.shutdown(grace),
            self.transformations.shutdown(grace),
        );
    }
}
