//! Lifecycle events published by the orchestrator and conflict service.
//!
//! Statistics are applied by the publisher before an event goes out. Other
//! consumers, such as the outbound webhook fan-out, hold their own receiver;
//! a slow subscriber only lags itself.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::SyncFailure;
use crate::models::enums::{ConflictStatus, ConflictStrategy};
use crate::models::sync_job::JobSummary;

const EVENT_BUS_CAPACITY: usize = 1024;

pub const JOB_COMPLETED: &str = "sync.job.completed";
pub const JOB_FAILED: &str = "sync.job.failed";
pub const CONFLICT_DETECTED: &str = "sync.conflict.detected";
pub const CONFLICT_RESOLVED: &str = "sync.conflict.resolved";
pub const WEBHOOK_REJECTED: &str = "sync.webhook.rejected";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    #[serde(rename_all = "camelCase")]
    JobCompleted {
        job_id: Uuid,
        connection_id: Uuid,
        provider_slug: String,
        attempt: u32,
        summary: JobSummary,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    /// Terminal failure only; retried attempts do not publish.
    #[serde(rename_all = "camelCase")]
    JobFailed {
        job_id: Uuid,
        connection_id: Uuid,
        provider_slug: String,
        attempt: u32,
        failure: SyncFailure,
        summary: JobSummary,
        duration_ms: u64,
        failed_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        conflict_id: Uuid,
        job_id: Option<Uuid>,
        connection_id: Uuid,
        provider_slug: String,
        resource_type: String,
        resource_id: String,
        strategy: ConflictStrategy,
        status: ConflictStatus,
    },
    /// Manual resolution of a conflict that had stayed OPEN.
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        conflict_id: Uuid,
        connection_id: Uuid,
        provider_slug: String,
        status: ConflictStatus,
        resolved_by: String,
    },
    #[serde(rename_all = "camelCase")]
    WebhookRejected {
        config_id: Uuid,
        connection_id: Uuid,
        reason: String,
    },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::JobCompleted { .. } => JOB_COMPLETED,
            SyncEvent::JobFailed { .. } => JOB_FAILED,
            SyncEvent::ConflictDetected { .. } => CONFLICT_DETECTED,
            SyncEvent::ConflictResolved { .. } => CONFLICT_RESOLVED,
            SyncEvent::WebhookRejected { .. } => WEBHOOK_REJECTED,
        }
    }

    pub fn connection_id(&self) -> Uuid {
        match self {
            SyncEvent::JobCompleted { connection_id, .. }
            | SyncEvent::JobFailed { connection_id, .. }
            | SyncEvent::ConflictDetected { connection_id, .. }
            | SyncEvent::ConflictResolved { connection_id, .. }
            | SyncEvent::WebhookRejected { connection_id, .. } => *connection_id,
        }
    }

    /// Whether subscribed webhook endpoints receive this event.
    pub fn is_deliverable(&self) -> bool {
        !matches!(self, SyncEvent::WebhookRejected { .. })
    }

    /// JSON body delivered to webhook subscribers.
    pub fn payload(&self) -> JsonValue {
        serde_json::json!({
            "eventType": self.event_type(),
            "occurredAt": Utc::now(),
            "data": self,
        })
    }
}

/// Broadcast channel of [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: SyncEvent) {
        let event_type = event.event_type();
        if self.sender.send(event).is_err() {
            tracing::trace!(event_type, "No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let connection_id = Uuid::new_v4();

        bus.publish(SyncEvent::WebhookRejected {
            config_id: Uuid::new_v4(),
            connection_id,
            reason: "invalid signature".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), WEBHOOK_REJECTED);
        assert_eq!(event.connection_id(), connection_id);
        assert!(!event.is_deliverable());
    }

    #[test]
    fn payload_wraps_event_data() {
        let event = SyncEvent::ConflictResolved {
            conflict_id: Uuid::nil(),
            connection_id: Uuid::nil(),
            provider_slug: "epic".to_string(),
            status: ConflictStatus::Resolved,
            resolved_by: "operator".to_string(),
        };
        let payload = event.payload();
        assert_eq!(payload["eventType"], CONFLICT_RESOLVED);
        assert_eq!(payload["data"]["type"], "conflictResolved");
        assert_eq!(payload["data"]["resolvedBy"], "operator");
    }
}
