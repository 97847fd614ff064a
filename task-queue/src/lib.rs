//! Keyed, multi-worker job queue with at-least-once delivery.
//!
//! Jobs are independent units of work distinguished by an optional
//! deterministic key: while a keyed job is queued or running, enqueueing
//! the same key again is a no-op. Handlers are registered per job kind;
//! recurring kinds are re-enqueued on a timer until the queue is shut
//! down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
}

impl JobError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

pub type JobResult = Result<(), JobError>;
pub type Handler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, JobResult> + Send + Sync + 'static>;

/// Per-job scheduling options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Collapses duplicate enqueues while the job is live.
    pub dedup_key: Option<String>,
    /// Total delivery attempts; `None` means a single attempt.
    pub attempts: Option<usize>,
    /// Fixed delay between redeliveries.
    pub backoff: Option<Duration>,
    /// Wall-clock budget per attempt; firing counts as a failed attempt.
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            dedup_key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_retries(mut self, attempts: usize, backoff: Duration) -> Self {
        self.attempts = Some(attempts);
        self.backoff = Some(backoff);
        self
    }

    pub fn with_timeout(mut self, budget: Duration) -> Self {
        self.timeout = Some(budget);
        self
    }
}

struct Job {
    kind: String,
    payload: serde_json::Value,
    options: JobOptions,
    attempt: usize,
}

struct Inner {
    tx: mpsc::UnboundedSender<Job>,
    live_keys: Mutex<HashSet<String>>,
    handlers: RwLock<HashMap<String, Handler>>,
    failed_jobs: AtomicU64,
    cancel: CancellationToken,
}

/// Handle to the queue; cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    /// Create a queue with `workers` concurrent job slots and start its
    /// dispatcher.
    pub fn start(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            tx,
            live_keys: Mutex::new(HashSet::new()),
            handlers: RwLock::new(HashMap::new()),
            failed_jobs: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        let queue = Self {
            inner: inner.clone(),
        };
        tokio::spawn(dispatch_loop(inner, rx, workers.max(1)));
        queue
    }

    /// Register the handler for a job kind. Last registration wins.
    pub fn on_task<F>(&self, kind: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> BoxFuture<'static, JobResult> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(kind.to_string(), Arc::new(handler));
    }

    /// Enqueue one job. Returns `false` when a live job already owns the
    /// dedup key.
    pub fn enqueue(&self, kind: &str, payload: serde_json::Value, options: JobOptions) -> bool {
        if let Some(key) = &options.dedup_key {
            let mut keys = self.inner.live_keys.lock();
            if !keys.insert(key.clone()) {
                debug!("job {key} already live, skipping enqueue");
                return false;
            }
        }
        let job = Job {
            kind: kind.to_string(),
            payload,
            options,
            attempt: 0,
        };
        if self.inner.tx.send(job).is_err() {
            warn!("task queue is shut down, dropping {kind} job");
            return false;
        }
        true
    }

    /// Re-enqueue `kind` with an empty payload every `interval` until the
    /// queue shuts down. Ticks dedup under the kind name so a slow pass
    /// never stacks.
    pub fn schedule_recurring(&self, kind: &str, interval: Duration) {
        let queue = self.clone();
        let kind = kind.to_string();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                queue.enqueue(
                    &kind,
                    serde_json::Value::Null,
                    JobOptions::keyed(kind.clone()),
                );
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    /// Jobs dropped after exhausting their attempts.
    pub fn failed_jobs(&self) -> u64 {
        self.inner.failed_jobs.load(Ordering::Relaxed)
    }

    /// Stop recurring schedules and the dispatcher. In-flight jobs run to
    /// completion (or their timeout).
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Job>, workers: usize) {
    let semaphore = Arc::new(Semaphore::new(workers));
    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = inner.cancel.cancelled() => break,
        };
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            run_job(inner, job).await;
            drop(permit);
        });
    }
}

async fn run_job(inner: Arc<Inner>, mut job: Job) {
    let handler = inner.handlers.read().get(&job.kind).cloned();
    let Some(handler) = handler else {
        error!("no handler registered for job kind {}", job.kind);
        release_key(&inner, &job);
        return;
    };

    let result = match job.options.timeout {
        Some(budget) => match timeout(budget, handler(job.payload.clone())).await {
            Ok(result) => result,
            Err(_) => Err(JobError::TimedOut(budget)),
        },
        None => handler(job.payload.clone()).await,
    };

    match result {
        Ok(()) => release_key(&inner, &job),
        Err(err) => {
            job.attempt += 1;
            let max_attempts = job.options.attempts.unwrap_or(1);
            if job.attempt < max_attempts {
                debug!(
                    "job {} attempt {}/{} failed: {err}",
                    job.kind, job.attempt, max_attempts
                );
                let backoff = job.options.backoff.unwrap_or(Duration::from_secs(1));
                let inner = inner.clone();
                tokio::spawn(async move {
                    sleep(backoff).await;
                    // Key stays held across redeliveries.
                    if inner.tx.send(job).is_err() {
                        warn!("queue shut down before redelivery");
                    }
                });
            } else {
                inner.failed_jobs.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "job {} ({}) dropped after {} attempt(s): {err}",
                    job.kind,
                    job.options.dedup_key.as_deref().unwrap_or("unkeyed"),
                    job.attempt
                );
                release_key(&inner, &job);
            }
        }
    }
}

fn release_key(inner: &Inner, job: &Job) {
    if let Some(key) = &job.options.dedup_key {
        inner.live_keys.lock().remove(key);
    }
}
