//! # Job Queue
//!
//! In-process priority queues with bounded worker pools. Each queue orders
//! ready jobs by priority (1 = critical first) and FIFO within a priority,
//! holds delayed jobs until their `run_at`, retries failed attempts with
//! exponential backoff plus jitter, and keeps a count- and age-bounded record
//! of finished jobs.
//!
//! Queues are plumbing only: durable job state lives in the database and
//! handlers are expected to be idempotent per job id.

mod tasks;
mod worker;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::config::QueueSettings;

pub use tasks::{ConflictTask, JobQueues, SyncJobTask, TransformTask, WebhookTask};

pub const SYNC_JOBS_QUEUE: &str = "sync-jobs";
pub const WEBHOOKS_QUEUE: &str = "webhooks";
pub const CONFLICTS_QUEUE: &str = "conflicts";
pub const TRANSFORMATIONS_QUEUE: &str = "transformations";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;
pub const DEFAULT_PRIORITY: u8 = 3;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {queue} is closed")]
    Closed { queue: String },
    #[error("job {job_id} is already waiting or active on queue {queue}")]
    DuplicateJob { queue: String, job_id: String },
    #[error("priority {0} is outside 1..=5")]
    InvalidPriority(u8),
}

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_factor: f64,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.backoff_base_ms),
            max: Duration::from_millis(settings.backoff_max_ms),
            jitter_factor: settings.jitter_factor,
        }
    }

    /// Delay before attempt `failed_attempts + 1`, i.e. `base * 2^(failed_attempts - 1)`
    /// capped at `max`, before jitter.
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(20);
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max)
    }

    pub fn delay_with_rng<R: Rng>(&self, failed_attempts: u32, rng: &mut R) -> Duration {
        let backoff = self.base_delay(failed_attempts);
        let jitter_ceiling = backoff.as_secs_f64() * self.jitter_factor;
        if jitter_ceiling <= 0.0 {
            return backoff;
        }
        backoff + Duration::from_secs_f64(rng.gen_range(0.0..jitter_ceiling))
    }

    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        self.delay_with_rng(failed_attempts, &mut rand::thread_rng())
    }
}

/// Per-enqueue options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    priority: Option<u8>,
    delay: Option<Duration>,
    max_attempts: Option<u32>,
    job_id: Option<String>,
    backoff: Option<BackoffPolicy>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// Explicit id; enqueueing the same id while it is waiting or active fails.
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// What a handler sees about the attempt it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub queue: &'static str,
    pub job_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Why an attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// Try again after backoff while attempts remain
    Retry(String),
    /// Do not try again
    Fatal(String),
    /// The attempt observed cancellation and stopped
    Cancelled,
}

#[async_trait]
pub trait JobHandler<T>: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, payload: T) -> Result<(), JobFailure>;
}

/// Outcome published for every finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueOutcome {
    Completed,
    Retrying { next_attempt: u32, delay_ms: u64 },
    Failed { error: String },
    Cancelled,
}

impl QueueOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            QueueOutcome::Completed => "completed",
            QueueOutcome::Retrying { .. } => "retrying",
            QueueOutcome::Failed { .. } => "failed",
            QueueOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEvent {
    pub queue: &'static str,
    pub job_id: String,
    pub attempt: u32,
    #[serde(flatten)]
    pub outcome: QueueOutcome,
}

/// Result of [`Queue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started and was removed
    Removed,
    /// The job is running; its cancellation token was triggered
    Signalled,
    NotFound,
}

/// Snapshot of a queue's job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    /// Ready or delayed jobs not yet started
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueuedJob<T> {
    id: String,
    payload: T,
    priority: u8,
    attempts_made: u32,
    max_attempts: u32,
    backoff: BackoffPolicy,
    run_at: Instant,
}

struct FinishedJob {
    finished_at: Instant,
}

enum NextJob<T> {
    Ready(QueuedJob<T>),
    WaitUntil(Instant),
    Empty,
}

struct QueueState<T> {
    /// Keyed by (priority, sequence) so iteration yields dispatch order.
    waiting: BTreeMap<(u8, u64), QueuedJob<T>>,
    known_ids: HashSet<String>,
    active: HashMap<String, CancellationToken>,
    completed: VecDeque<FinishedJob>,
    failed: VecDeque<FinishedJob>,
    sequence: u64,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            waiting: BTreeMap::new(),
            known_ids: HashSet::new(),
            active: HashMap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            sequence: 0,
        }
    }

    fn push(&mut self, job: QueuedJob<T>) {
        self.sequence += 1;
        self.known_ids.insert(job.id.clone());
        self.waiting.insert((job.priority, self.sequence), job);
    }

    fn take_next(&mut self, now: Instant) -> NextJob<T> {
        let mut earliest: Option<Instant> = None;
        let mut ready_key = None;
        for (key, job) in &self.waiting {
            if job.run_at <= now {
                ready_key = Some(*key);
                break;
            }
            earliest = Some(earliest.map_or(job.run_at, |at: Instant| at.min(job.run_at)));
        }

        match ready_key.and_then(|key| self.waiting.remove(&key)) {
            Some(job) => NextJob::Ready(job),
            None => match earliest {
                Some(at) => NextJob::WaitUntil(at),
                None => NextJob::Empty,
            },
        }
    }

    fn remove_waiting(&mut self, job_id: &str) -> bool {
        let key = self
            .waiting
            .iter()
            .find(|(_, job)| job.id == job_id)
            .map(|(key, _)| *key);
        match key {
            Some(key) => {
                self.waiting.remove(&key);
                self.known_ids.remove(job_id);
                true
            }
            None => false,
        }
    }

    fn prune(&mut self, settings: &QueueSettings, now: Instant) {
        prune_finished(
            &mut self.completed,
            settings.keep_completed,
            Duration::from_secs(settings.keep_completed_age_seconds),
            now,
        );
        prune_finished(
            &mut self.failed,
            settings.keep_failed,
            Duration::from_secs(settings.keep_failed_age_seconds),
            now,
        );
    }

    fn counts(&self, now: Instant) -> QueueCounts {
        let delayed = self.waiting.values().filter(|job| job.run_at > now).count();
        QueueCounts {
            waiting: self.waiting.len(),
            delayed,
            active: self.active.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
        }
    }
}

fn prune_finished(jobs: &mut VecDeque<FinishedJob>, keep: usize, max_age: Duration, now: Instant) {
    while jobs.len() > keep {
        jobs.pop_front();
    }
    while jobs
        .front()
        .is_some_and(|job| now.saturating_duration_since(job.finished_at) > max_age)
    {
        jobs.pop_front();
    }
}

struct QueueInner<T> {
    name: &'static str,
    settings: QueueSettings,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<QueueEvent>,
    closed: AtomicBool,
    /// Stops dispatching new attempts
    stop: CancellationToken,
    /// Parent of every running attempt's cancellation token
    abort: CancellationToken,
}

/// A named priority queue. Cloning yields another handle to the same queue.
pub struct Queue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("concurrency", &self.inner.settings.concurrency)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Queue<T> {
    pub fn new(name: &'static str, settings: QueueSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            inner: Arc::new(QueueInner {
                name,
                settings,
                state: Mutex::new(QueueState::new()),
                notify: Notify::new(),
                permits,
                events,
                closed: AtomicBool::new(false),
                stop: CancellationToken::new(),
                abort: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Adds a job and returns its id.
    pub async fn enqueue(&self, payload: T, options: JobOptions) -> Result<String, QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed {
                queue: self.inner.name.to_string(),
            });
        }

        let priority = options.priority.unwrap_or(DEFAULT_PRIORITY);
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(QueueError::InvalidPriority(priority));
        }

        let id = options
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let job = QueuedJob {
            id: id.clone(),
            payload,
            priority,
            attempts_made: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.inner.settings.max_attempts)
                .max(1),
            backoff: options
                .backoff
                .unwrap_or_else(|| BackoffPolicy::from_settings(&self.inner.settings)),
            run_at: Instant::now() + options.delay.unwrap_or_default(),
        };

        {
            let mut state = self.inner.state.lock().await;
            if state.known_ids.contains(&id) {
                return Err(QueueError::DuplicateJob {
                    queue: self.inner.name.to_string(),
                    job_id: id,
                });
            }
            state.push(job);
        }
        self.inner.notify.notify_one();

        tracing::debug!(queue = self.inner.name, job_id = %id, priority, "Job enqueued");
        Ok(id)
    }

    /// Removes a job that has not started, or signals a running one.
    pub async fn cancel(&self, job_id: &str) -> CancelOutcome {
        let mut state = self.inner.state.lock().await;
        if state.remove_waiting(job_id) {
            tracing::info!(queue = self.inner.name, job_id, "Removed queued job");
            return CancelOutcome::Removed;
        }
        if let Some(token) = state.active.get(job_id) {
            token.cancel();
            tracing::info!(queue = self.inner.name, job_id, "Signalled running job to cancel");
            return CancelOutcome::Signalled;
        }
        CancelOutcome::NotFound
    }

    pub async fn counts(&self) -> QueueCounts {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.prune(&self.inner.settings, now);
        state.counts(now)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Starts the dispatcher that feeds `handler` with up to `concurrency` jobs at once.
    pub fn start(&self, handler: Arc<dyn JobHandler<T>>) -> JoinHandle<()> {
        tokio::spawn(worker::dispatch(Arc::clone(&self.inner), handler))
    }

    /// Stops accepting and dispatching work, then waits up to `grace` for
    /// running attempts before cancelling them.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.stop.cancel();

        let all_permits = self.inner.settings.concurrency.max(1) as u32;
        let drained = tokio::time::timeout(grace, self.inner.permits.acquire_many(all_permits)).await;
        match drained {
            Ok(Ok(_permits)) => {
                tracing::info!(queue = self.inner.name, "Queue drained");
            }
            _ => {
                tracing::warn!(
                    queue = self.inner.name,
                    grace_ms = grace.as_millis() as u64,
                    "Queue did not drain in time; cancelling running jobs"
                );
                self.inner.abort.cancel();
            }
        }
    }
}
