//! Inbound provider events: verify, de-duplicate, log, enqueue, route.

use axum::http::HeaderMap;
use metrics::counter;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use super::verification::{self, VerificationError};
use super::{InboundEvent, PROCESSED_EVENT_TYPES, WebhookError, WebhookService};
use crate::collaborators::CriticalAlert;
use crate::error::SyncFailure;
use crate::events::SyncEvent;
use crate::models::enums::{
    ErrorSeverity, FailureKind, JobType, SyncDirection, WebhookDirection, WebhookOutcome,
};
use crate::models::webhook_config::Model as WebhookConfigModel;
use crate::orchestrator::{JobSpec, OrchestratorError};
use crate::queue::{JobOptions, QueueError, TransformTask, WebhookTask};
use crate::repositories::webhook_log::NewWebhookLog;

pub const WEBHOOK_ID_HEADER: &str = "x-webhook-id";
/// Reference-only events jump ahead of scheduled work.
const WEBHOOK_JOB_PRIORITY: u8 = 2;

/// Response to an accepted (or acknowledged-but-ignored) inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveAck {
    pub log_id: Uuid,
    pub status: WebhookOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_job_id: Option<String>,
}

struct InboundLog<'a> {
    id: Uuid,
    config_id: Uuid,
    payload_hash: &'a str,
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    signature_valid: Option<bool>,
    outcome: WebhookOutcome,
    attempt: i32,
    error: Option<String>,
    queue_job_id: Option<String>,
}

impl WebhookService {
    async fn log_inbound(&self, entry: InboundLog<'_>) -> Result<Uuid, WebhookError> {
        let log = self
            .logs
            .append(NewWebhookLog {
                id: entry.id,
                config_id: entry.config_id,
                direction: WebhookDirection::Inbound,
                event_type: entry.event_type,
                payload_hash: entry.payload_hash.to_string(),
                payload: entry.payload,
                signature_valid: entry.signature_valid,
                outcome: entry.outcome,
                http_status: None,
                attempt: entry.attempt,
                error: entry.error,
                queue_job_id: entry.queue_job_id,
            })
            .await?;
        Ok(log.id)
    }

    /// Verifies and accepts one inbound event. Rejections are logged before
    /// the error is returned; accepted events are queued for processing.
    pub async fn receive(&self, headers: &HeaderMap, body: &[u8]) -> Result<ReceiveAck, WebhookError> {
        let limit_bytes = self.max_body_bytes();
        if body.len() > limit_bytes {
            counter!("webhook_received_total", "outcome" => "too_large").increment(1);
            return Err(WebhookError::PayloadTooLarge { limit_bytes });
        }

        let config = match headers
            .get(WEBHOOK_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
        {
            Some(id) => self.configs.find_active(id).await?,
            None => None,
        };
        let Some(config) = config else {
            counter!("webhook_received_total", "outcome" => "unknown_config").increment(1);
            return Err(WebhookError::UnknownConfig);
        };
        let Some(connection) = self
            .collaborators
            .directory
            .get_active_connection(config.connection_id)
            .await?
        else {
            counter!("webhook_received_total", "outcome" => "unknown_config").increment(1);
            return Err(WebhookError::UnknownConfig);
        };

        let payload_hash = verification::payload_hash(body);
        let header = config.signature_algorithm.header_name();
        let signature = headers
            .get(header)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        let secret = self.secret_for(&config)?;
        let verdict = if signature.trim().is_empty() {
            Err(VerificationError::MissingSignature { header })
        } else {
            match self.adapters.get(&connection.provider_slug) {
                Some(adapter)
                    if adapter.verify_webhook(&secret, config.signature_algorithm, body, signature) =>
                {
                    Ok(())
                }
                Some(_) => Err(VerificationError::VerificationFailed),
                None => verification::verify(&secret, config.signature_algorithm, body, signature),
            }
        };
        if let Err(reason) = verdict {
            self.reject(&config, &payload_hash, &reason).await?;
            return Err(match reason {
                VerificationError::MissingSignature { .. } => WebhookError::MissingSignature,
                _ => WebhookError::InvalidSignature,
            });
        }

        if !self
            .replay_guard
            .check_and_record(config.id, &payload_hash)
            .await
        {
            self.log_inbound(InboundLog {
                id: Uuid::new_v4(),
                config_id: config.id,
                payload_hash: &payload_hash,
                event_type: None,
                payload: None,
                signature_valid: Some(true),
                outcome: WebhookOutcome::ReplayRejected,
                attempt: 1,
                error: Some("duplicate payload within replay window".to_string()),
                queue_job_id: None,
            })
            .await?;
            counter!("webhook_received_total", "outcome" => "replay").increment(1);
            tracing::warn!(webhook_config_id = %config.id, payload_hash = %payload_hash, "Webhook replay rejected");
            return Err(WebhookError::Replay);
        }

        let accepted = self.accept_verified(&config, &payload_hash, body).await;
        if let Err(WebhookError::Database(_) | WebhookError::Queue(_)) = &accepted {
            // Nothing was queued; the provider's redelivery must not count as a replay.
            self.replay_guard.release(config.id, &payload_hash).await;
        }
        accepted
    }

    /// Parses a verified, first-seen payload and queues it for routing. The
    /// ACCEPTED log row is written only once the queue has taken the event.
    async fn accept_verified(
        &self,
        config: &WebhookConfigModel,
        payload_hash: &str,
        body: &[u8],
    ) -> Result<ReceiveAck, WebhookError> {
        let event = match serde_json::from_slice::<InboundEvent>(body) {
            Ok(event) if !event.event_type.trim().is_empty() => event,
            Ok(_) => return Err(self.malformed(config, payload_hash, "eventType is empty").await?),
            Err(error) => {
                return Err(self
                    .malformed(config, payload_hash, &error.to_string())
                    .await?);
            }
        };
        let payload = serde_json::to_value(&event).ok();

        if !config.subscribes_to(&event.event_type) {
            let log_id = self
                .log_inbound(InboundLog {
                    id: Uuid::new_v4(),
                    config_id: config.id,
                    payload_hash,
                    event_type: Some(event.event_type.clone()),
                    payload,
                    signature_valid: Some(true),
                    outcome: WebhookOutcome::Ignored,
                    attempt: 1,
                    error: Some("event type not subscribed".to_string()),
                    queue_job_id: None,
                })
                .await?;
            counter!("webhook_received_total", "outcome" => "ignored").increment(1);
            return Ok(ReceiveAck {
                log_id,
                status: WebhookOutcome::Ignored,
                queue_job_id: None,
            });
        }

        let log_id = Uuid::new_v4();
        let queue_job_id = format!("webhook-process-{log_id}");
        if let Err(error) = self
            .queues
            .webhooks
            .enqueue(
                WebhookTask::Process {
                    log_id,
                    config_id: config.id,
                    payload_hash: payload_hash.to_string(),
                    event: event.clone(),
                },
                JobOptions::new()
                    .job_id(queue_job_id.clone())
                    .max_attempts(config.retry_attempts.max(1) as u32),
            )
            .await
        {
            counter!("webhook_received_total", "outcome" => "enqueue_failed").increment(1);
            tracing::error!(
                webhook_config_id = %config.id,
                event_type = %event.event_type,
                error = %error,
                "Webhook could not be queued"
            );
            return Err(error.into());
        }

        // The event is queued from here on, so a failed audit write must not
        // turn into an error the provider would retry.
        if let Err(error) = self
            .log_inbound(InboundLog {
                id: log_id,
                config_id: config.id,
                payload_hash,
                event_type: Some(event.event_type.clone()),
                payload,
                signature_valid: Some(true),
                outcome: WebhookOutcome::Accepted,
                attempt: 1,
                error: None,
                queue_job_id: Some(queue_job_id.clone()),
            })
            .await
        {
            tracing::error!(
                webhook_config_id = %config.id,
                log_id = %log_id,
                error = %error,
                "Failed to log accepted webhook"
            );
        }

        counter!("webhook_received_total", "outcome" => "accepted").increment(1);
        tracing::info!(
            webhook_config_id = %config.id,
            event_type = %event.event_type,
            queue_job_id = %queue_job_id,
            "Webhook accepted"
        );
        Ok(ReceiveAck {
            log_id,
            status: WebhookOutcome::Accepted,
            queue_job_id: Some(queue_job_id),
        })
    }

    async fn malformed(
        &self,
        config: &WebhookConfigModel,
        payload_hash: &str,
        reason: &str,
    ) -> Result<WebhookError, WebhookError> {
        self.log_inbound(InboundLog {
            id: Uuid::new_v4(),
            config_id: config.id,
            payload_hash,
            event_type: None,
            payload: None,
            signature_valid: Some(true),
            outcome: WebhookOutcome::Malformed,
            attempt: 1,
            error: Some(reason.to_string()),
            queue_job_id: None,
        })
        .await?;
        counter!("webhook_received_total", "outcome" => "malformed").increment(1);
        Ok(WebhookError::Malformed(reason.to_string()))
    }

    /// Logs a signature failure and alerts operators. Never retried.
    async fn reject(
        &self,
        config: &WebhookConfigModel,
        payload_hash: &str,
        reason: &VerificationError,
    ) -> Result<(), WebhookError> {
        self.log_inbound(InboundLog {
            id: Uuid::new_v4(),
            config_id: config.id,
            payload_hash,
            event_type: None,
            payload: None,
            signature_valid: Some(false),
            outcome: WebhookOutcome::SignatureInvalid,
            attempt: 1,
            error: Some(reason.to_string()),
            queue_job_id: None,
        })
        .await?;

        counter!("webhook_received_total", "outcome" => "signature_invalid").increment(1);
        tracing::warn!(
            webhook_config_id = %config.id,
            payload_hash,
            reason = %reason,
            "Webhook signature rejected"
        );
        self.events.publish(SyncEvent::WebhookRejected {
            config_id: config.id,
            connection_id: config.connection_id,
            reason: reason.to_string(),
        });
        self.collaborators
            .notifier
            .notify(CriticalAlert {
                severity: ErrorSeverity::Critical,
                code: FailureKind::WebhookSignatureInvalid.error_code().to_string(),
                message: format!("webhook {} rejected: {reason}", config.id),
                job_id: None,
                connection_id: Some(config.connection_id),
                webhook_config_id: Some(config.id),
            })
            .await;
        Ok(())
    }

    /// Routes an accepted event: inline resources go to the transformation
    /// queue, references become SINGLE_RESOURCE inbound sync jobs.
    pub async fn process_event(
        &self,
        log_id: Uuid,
        config_id: Uuid,
        payload_hash: &str,
        event: InboundEvent,
        attempt: u32,
    ) -> Result<WebhookOutcome, SyncFailure> {
        let config = self.configs.find_by_id(config_id).await?.ok_or_else(|| {
            SyncFailure::fatal(
                FailureKind::Validation,
                format!("webhook config {config_id} no longer exists"),
            )
        })?;
        let routed = self.route_event(&config, log_id, payload_hash, &event).await;
        let (outcome, error, queue_job_id) = match &routed {
            Ok((outcome, queue_job_id)) => (*outcome, None, queue_job_id.clone()),
            Err(failure) => (
                WebhookOutcome::ProcessingFailed,
                Some(failure.message.clone()),
                None,
            ),
        };
        self.log_inbound(InboundLog {
            id: Uuid::new_v4(),
            config_id,
            payload_hash,
            event_type: Some(event.event_type.clone()),
            payload: serde_json::to_value(&event).ok(),
            signature_valid: None,
            outcome,
            attempt: attempt as i32,
            error,
            queue_job_id,
        })
        .await
        .map_err(|error| SyncFailure::new(FailureKind::Persistence, error.to_string()))?;

        routed.map(|(outcome, _)| outcome)
    }

    async fn route_event(
        &self,
        config: &WebhookConfigModel,
        log_id: Uuid,
        payload_hash: &str,
        event: &InboundEvent,
    ) -> Result<(WebhookOutcome, Option<String>), SyncFailure> {
        if let Some(claimed) = event.connection_id
            && claimed != config.connection_id
        {
            return Err(SyncFailure::fatal(
                FailureKind::Validation,
                format!("event names connection {claimed} but config belongs to another"),
            ));
        }
        if !PROCESSED_EVENT_TYPES.contains(&event.event_type.as_str()) {
            tracing::info!(event_type = %event.event_type, "Webhook event type not processed");
            return Ok((WebhookOutcome::Ignored, None));
        }
        let (Some(resource_type), Some(resource_id)) = (&event.resource_type, &event.resource_id)
        else {
            tracing::info!(log_id = %log_id, "Webhook event carries no resource reference");
            return Ok((WebhookOutcome::Ignored, None));
        };

        if let Some(resource) = &event.resource {
            let modified_at = resource
                .pointer("/meta/lastUpdated")
                .and_then(|value| value.as_str())
                .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
                .map(|at| at.with_timezone(&chrono::Utc));
            let job_id = format!("transform-{log_id}");
            let queued = self
                .queues
                .transformations
                .enqueue(
                    TransformTask {
                        config_id: config.id,
                        payload_hash: payload_hash.to_string(),
                        connection_id: config.connection_id,
                        resource_type: resource_type.clone(),
                        resource_id: resource_id.clone(),
                        record: resource.clone(),
                        modified_at,
                    },
                    JobOptions::new().job_id(job_id.clone()),
                )
                .await;
            return match queued {
                Ok(id) => Ok((WebhookOutcome::Processed, Some(id))),
                Err(QueueError::DuplicateJob { .. }) => {
                    Ok((WebhookOutcome::Processed, Some(job_id)))
                }
                Err(error) => Err(SyncFailure::new(FailureKind::Connection, error.to_string())),
            };
        }

        // Keyed on the accepted delivery, so a retried attempt finds the job
        // its predecessor created instead of adding a second one.
        let created = self
            .orchestrator
            .create_keyed_job(log_id, JobSpec {
                connection_id: config.connection_id,
                job_type: JobType::SingleResource,
                direction: SyncDirection::Inbound,
                priority: Some(WEBHOOK_JOB_PRIORITY),
                resource_types: vec![resource_type.clone()],
                since: None,
                patient_id: event.patient_id.clone(),
                resource_id: Some(resource_id.clone()),
                max_attempts: None,
            })
            .await;
        match created {
            Ok(job) => Ok((WebhookOutcome::Processed, Some(job.id.to_string()))),
            Err(
                error @ (OrchestratorError::Validation { .. }
                | OrchestratorError::NotFound { .. }
                | OrchestratorError::ConnectionInactive(_)),
            ) => Err(SyncFailure::fatal(FailureKind::Validation, error.to_string())),
            Err(error) => Err(SyncFailure::new(FailureKind::Connection, error.to_string())),
        }
    }

    /// Records an inline resource the transformation queue gave up on.
    pub async fn record_transform_failure(
        &self,
        task: &TransformTask,
        failure: &SyncFailure,
        queue_job_id: &str,
        attempt: u32,
    ) {
        let reference = format!("{}/{}", task.resource_type, task.resource_id);
        if let Err(error) = self
            .log_inbound(InboundLog {
                id: Uuid::new_v4(),
                config_id: task.config_id,
                payload_hash: &task.payload_hash,
                event_type: None,
                payload: Some(task.record.clone()),
                signature_valid: None,
                outcome: WebhookOutcome::ProcessingFailed,
                attempt: attempt as i32,
                error: Some(format!("{}: {reference}: {}", failure.code(), failure.message)),
                queue_job_id: Some(queue_job_id.to_string()),
            })
            .await
        {
            tracing::error!(
                webhook_config_id = %task.config_id,
                resource = %reference,
                error = %error,
                "Failed to log abandoned inline resource"
            );
        }

        counter!("webhook_transform_failed_total").increment(1);
        tracing::error!(
            webhook_config_id = %task.config_id,
            resource = %reference,
            attempt,
            code = failure.code(),
            error = %failure.message,
            "Inline resource abandoned"
        );
        if failure.retryable {
            self.collaborators
                .notifier
                .notify(CriticalAlert {
                    severity: ErrorSeverity::Critical,
                    code: failure.code().to_string(),
                    message: format!(
                        "inline resource {reference} failed after {attempt} attempts: {}",
                        failure.message
                    ),
                    job_id: None,
                    connection_id: Some(task.connection_id),
                    webhook_config_id: Some(task.config_id),
                })
                .await;
        }
    }
}
