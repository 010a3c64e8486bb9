//! Dispatcher loop and per-attempt execution for a [`Queue`](super::Queue).

use std::sync::Arc;
use std::time::Instant as StdInstant;

use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::Instrument;

use super::{
    FinishedJob, JobContext, JobFailure, JobHandler, NextJob, QueueEvent, QueueInner,
    QueueOutcome, QueuedJob,
};

pub(super) async fn dispatch<T: Clone + Send + Sync + 'static>(
    inner: Arc<QueueInner<T>>,
    handler: Arc<dyn JobHandler<T>>,
) {
    tracing::info!(
        queue = inner.name,
        concurrency = inner.settings.concurrency,
        "Queue dispatcher started"
    );

    loop {
        let permit = tokio::select! {
            biased;
            _ = inner.stop.cancelled() => break,
            permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(job) = next_ready(&inner).await else {
            break;
        };

        let inner = Arc::clone(&inner);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            execute(inner, handler, job).await;
            drop(permit);
        });
    }

    tracing::info!(queue = inner.name, "Queue dispatcher stopped");
}

/// Waits for the next eligible job; `None` once the queue is stopping.
async fn next_ready<T>(inner: &QueueInner<T>) -> Option<QueuedJob<T>> {
    loop {
        let next = inner.state.lock().await.take_next(Instant::now());
        match next {
            NextJob::Ready(job) => return Some(job),
            NextJob::WaitUntil(at) => {
                tokio::select! {
                    biased;
                    _ = inner.stop.cancelled() => return None,
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            NextJob::Empty => {
                tokio::select! {
                    biased;
                    _ = inner.stop.cancelled() => return None,
                    _ = inner.notify.notified() => {}
                }
            }
        }
    }
}

async fn execute<T: Clone + Send + Sync + 'static>(
    inner: Arc<QueueInner<T>>,
    handler: Arc<dyn JobHandler<T>>,
    mut job: QueuedJob<T>,
) {
    let attempt = job.attempts_made + 1;
    let cancel = inner.abort.child_token();
    inner
        .state
        .lock()
        .await
        .active
        .insert(job.id.clone(), cancel.clone());

    let ctx = JobContext {
        queue: inner.name,
        job_id: job.id.clone(),
        attempt,
        max_attempts: job.max_attempts,
        cancel,
    };
    let span = tracing::info_span!(
        "queue_job",
        queue = inner.name,
        job_id = %job.id,
        attempt,
        max_attempts = job.max_attempts
    );

    let started = StdInstant::now();
    let payload = job.payload.clone();
    let run = tokio::spawn(async move { handler.handle(ctx, payload).await }.instrument(span));
    let result = match run.await {
        Ok(result) => result,
        Err(join_error) => {
            tracing::error!(queue = inner.name, job_id = %job.id, error = %join_error, "Job handler panicked");
            Err(JobFailure::Fatal(format!("handler aborted: {join_error}")))
        }
    };
    histogram!("queue_job_duration_ms", "queue" => inner.name)
        .record(started.elapsed().as_millis() as f64);

    let now = Instant::now();
    let job_id = job.id.clone();
    let outcome = {
        let mut state = inner.state.lock().await;
        state.active.remove(&job.id);

        let outcome = match result {
            Ok(()) => {
                state.known_ids.remove(&job.id);
                state.completed.push_back(FinishedJob { finished_at: now });
                QueueOutcome::Completed
            }
            Err(JobFailure::Retry(reason)) if attempt < job.max_attempts => {
                let delay = job.backoff.delay_for(attempt);
                tracing::warn!(
                    queue = inner.name,
                    job_id = %job.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    "Job attempt failed; retrying"
                );
                job.attempts_made = attempt;
                job.run_at = now + delay;
                state.push(job);
                inner.notify.notify_one();
                QueueOutcome::Retrying {
                    next_attempt: attempt + 1,
                    delay_ms: delay.as_millis() as u64,
                }
            }
            Err(JobFailure::Retry(reason)) | Err(JobFailure::Fatal(reason)) => {
                tracing::error!(
                    queue = inner.name,
                    job_id = %job.id,
                    attempt,
                    error = %reason,
                    "Job failed"
                );
                state.known_ids.remove(&job.id);
                state.failed.push_back(FinishedJob { finished_at: now });
                QueueOutcome::Failed { error: reason }
            }
            Err(JobFailure::Cancelled) => {
                state.known_ids.remove(&job.id);
                QueueOutcome::Cancelled
            }
        };
        state.prune(&inner.settings, now);
        outcome
    };

    counter!("queue_jobs_total", "queue" => inner.name, "outcome" => outcome.label()).increment(1);

    // No subscribers is fine.
    let _ = inner.events.send(QueueEvent {
        queue: inner.name,
        job_id,
        attempt,
        outcome,
    });
}
