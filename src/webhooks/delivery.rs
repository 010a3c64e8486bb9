//! Outbound delivery of engine events to subscribed webhook endpoints.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::verification;
use super::{WebhookError, WebhookService};
use crate::error::SyncFailure;
use crate::events::SyncEvent;
use crate::models::enums::{FailureKind, WebhookDirection, WebhookOutcome};
use crate::models::webhook_config::Model as WebhookConfigModel;
use crate::queue::{BackoffPolicy, JobOptions, WebhookTask};
use crate::repositories::webhook_log::NewWebhookLog;

pub const EVENT_HEADER: &str = "x-webhook-event";
pub const DELIVERY_ID_HEADER: &str = "x-webhook-id";
pub const ATTEMPT_HEADER: &str = "x-webhook-attempt";
const MAX_BACKOFF_MULTIPLIER: u32 = 32;

fn delivery_backoff(config: &WebhookConfigModel) -> BackoffPolicy {
    let base = Duration::from_millis(config.retry_delay_ms.max(1) as u64);
    BackoffPolicy {
        base,
        max: base.saturating_mul(MAX_BACKOFF_MULTIPLIER),
        jitter_factor: 0.1,
    }
}

impl WebhookService {
    /// Queues one delivery per active config on the event's connection that
    /// subscribes to it. Returns the number of deliveries queued.
    pub async fn fan_out(&self, event: &SyncEvent) -> Result<usize, WebhookError> {
        if !event.is_deliverable() {
            return Ok(0);
        }
        let event_type = event.event_type();
        let payload = event.payload();
        let mut queued = 0;
        for config in self
            .configs
            .list_active_for_connection(event.connection_id())
            .await?
        {
            if !config.subscribes_to(event_type) {
                continue;
            }
            self.enqueue_delivery(&config, event_type.to_string(), payload.clone())
                .await?;
            queued += 1;
        }
        Ok(queued)
    }

    async fn enqueue_delivery(
        &self,
        config: &WebhookConfigModel,
        event_type: String,
        payload: JsonValue,
    ) -> Result<String, WebhookError> {
        let delivery_id = Uuid::new_v4();
        let job_id = self
            .queues
            .webhooks
            .enqueue(
                WebhookTask::Deliver {
                    config_id: config.id,
                    delivery_id,
                    event_type,
                    payload,
                },
                JobOptions::new()
                    .job_id(format!("webhook-deliver-{delivery_id}"))
                    .max_attempts(config.retry_attempts.max(1) as u32)
                    .backoff(delivery_backoff(config)),
            )
            .await?;
        Ok(job_id)
    }

    /// Re-queues the most recent failed outbound delivery for a config.
    pub async fn retry_last_failed(&self, config_id: Uuid) -> Result<String, WebhookError> {
        let config = self.get_config(config_id).await?;
        let failed = self
            .logs
            .latest_failed_delivery(config_id)
            .await?
            .ok_or_else(|| WebhookError::NotFound {
                entity: "failed delivery for webhook config",
                id: config_id.to_string(),
            })?;
        let (Some(event_type), Some(payload)) = (failed.event_type, failed.payload) else {
            return Err(WebhookError::Validation {
                field: None,
                message: "failed delivery has no stored payload to resend".to_string(),
            });
        };

        let job_id = self.enqueue_delivery(&config, event_type, payload).await?;
        tracing::info!(webhook_config_id = %config_id, queue_job_id = %job_id, "Webhook redelivery queued");
        Ok(job_id)
    }

    /// One signed POST attempt. Each attempt is logged whatever its outcome.
    pub async fn deliver(
        &self,
        config_id: Uuid,
        delivery_id: Uuid,
        event_type: &str,
        payload: &JsonValue,
        attempt: u32,
    ) -> Result<(), SyncFailure> {
        let config = self.configs.find_active(config_id).await?.ok_or_else(|| {
            SyncFailure::fatal(
                FailureKind::Validation,
                format!("webhook config {config_id} is not active"),
            )
        })?;
        let secret = self
            .secret_for(&config)
            .map_err(|error| SyncFailure::fatal(FailureKind::Validation, error.to_string()))?;

        let body = serde_json::to_vec(payload)
            .map_err(|error| SyncFailure::fatal(FailureKind::Validation, error.to_string()))?;
        let signature = verification::sign(&secret, config.signature_algorithm, &body);

        let response = self
            .client
            .post(&config.endpoint)
            .timeout(Duration::from_millis(config.timeout_ms.max(1) as u64))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, event_type)
            .header(DELIVERY_ID_HEADER, delivery_id.to_string())
            .header(ATTEMPT_HEADER, attempt.to_string())
            .header(config.signature_algorithm.header_name(), signature)
            .body(body.clone())
            .send()
            .await;

        let (http_status, result) = match response {
            Ok(response) if response.status().is_success() => {
                (Some(response.status().as_u16()), Ok(()))
            }
            Ok(response) => {
                let status = response.status();
                let message = format!("endpoint returned HTTP {}", status.as_u16());
                let failure = if status.is_server_error()
                    || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                {
                    SyncFailure::new(FailureKind::Connection, message)
                } else {
                    SyncFailure::fatal(FailureKind::Validation, message)
                };
                (Some(status.as_u16()), Err(failure))
            }
            Err(error) if error.is_timeout() => (
                None,
                Err(SyncFailure::timeout(format!(
                    "delivery exceeded {}ms",
                    config.timeout_ms
                ))),
            ),
            Err(error) => (
                None,
                Err(SyncFailure::new(FailureKind::Connection, error.to_string())),
            ),
        };

        let outcome = if result.is_ok() {
            WebhookOutcome::Delivered
        } else {
            WebhookOutcome::DeliveryFailed
        };
        self.logs
            .append(NewWebhookLog {
                id: Uuid::new_v4(),
                config_id,
                direction: WebhookDirection::Outbound,
                event_type: Some(event_type.to_string()),
                payload_hash: verification::payload_hash(&body),
                payload: Some(payload.clone()),
                signature_valid: None,
                outcome,
                http_status: http_status.map(i32::from),
                attempt: attempt as i32,
                error: result.as_ref().err().map(|failure| failure.message.clone()),
                queue_job_id: Some(format!("webhook-deliver-{delivery_id}")),
            })
            .await?;

        counter!("webhook_deliveries_total", "outcome" => if result.is_ok() { "delivered" } else { "failed" })
            .increment(1);
        match &result {
            Ok(()) => tracing::info!(
                webhook_config_id = %config_id,
                delivery_id = %delivery_id,
                event_type,
                attempt,
                "Webhook delivered"
            ),
            Err(failure) => tracing::warn!(
                webhook_config_id = %config_id,
                delivery_id = %delivery_id,
                event_type,
                attempt,
                retryable = failure.retryable,
                error = %failure.message,
                "Webhook delivery failed"
            ),
        }
        result
    }
}

/// Forwards lifecycle events to subscribed endpoints until `shutdown` fires.
pub fn spawn_fan_out(
    service: Arc<WebhookService>,
    mut events: broadcast::Receiver<SyncEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Webhook fan-out lagged; events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if let Err(error) = service.fan_out(&event).await {
                tracing::error!(
                    event_type = event.event_type(),
                    error = %error,
                    "Failed to queue webhook deliveries"
                );
            }
        }
        tracing::debug!("Webhook fan-out stopped");
    })
}
