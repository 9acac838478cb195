//! The queue store contract.
//!
//! [`Queue`] is one named, durable job queue. The engine only ever talks to
//! queues through this trait, so any backend that can satisfy it (Redis-,
//! SQL-, or memory-backed) can sit underneath. [`memory::InMemoryQueue`] is
//! the reference implementation and the test substrate.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::job::{JobId, JobProgress, QueueState, ResolvedJobOptions};

pub mod memory;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error encoding or decoding job data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("queue store in bad state")]
    BadState,
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("invalid cron expression `{0}`")]
    InvalidCron(String),
}

/// A job ready to be enqueued.
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub opts: ResolvedJobOptions,
    /// When the job becomes eligible for execution (enqueue time plus any
    /// requested delay).
    pub scheduled_at: DateTime<Utc>,
}

/// A job as held by a queue.
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub id: JobId,
    pub name: String,
    pub data: Value,
    pub opts: ResolvedJobOptions,
    pub state: QueueState,
    pub attempts_made: u32,
    pub progress: JobProgress,
    pub logs: Vec<String>,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StoredJob {
    /// Wall-clock duration of the last completed execution, if both
    /// timestamps have been recorded.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some((finished - started).num_milliseconds()),
            _ => None,
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.data.get("tenantId").and_then(Value::as_str)
    }

    /// Advisory cancellation flag set by `cancel_job` on a processing job.
    pub fn is_cancelled(&self) -> bool {
        self.data.get("cancelled").and_then(Value::as_bool) == Some(true)
    }
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u32,
    pub active: u32,
    pub completed: u32,
    pub failed: u32,
    pub delayed: u32,
}

/// Lifecycle events emitted by a queue.
///
/// `Failed` fires on every failed attempt, carrying the attempt counters so
/// subscribers can tell an exhausted job from one the store will retry.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Completed {
        id: JobId,
        duration_ms: Option<i64>,
    },
    Failed {
        id: JobId,
        attempts_made: u32,
        max_attempts: u32,
        reason: String,
    },
    Stalled {
        id: JobId,
    },
    Error {
        message: String,
    },
}

pub type ReadyJobStream = Pin<Box<dyn Stream<Item = Result<StoredJob, StoreError>> + Send>>;

/// One named, durable job queue.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Enqueue a job, returning its store-assigned id.
    async fn add(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Register a named recurring job. The store's cron engine re-fires it
    /// on schedule; callers only issue this one registration.
    async fn add_repeatable(
        &self,
        name: String,
        data: Value,
        cron_expr: &str,
        opts: ResolvedJobOptions,
    ) -> Result<(), StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<StoredJob>, StoreError>;

    /// Jobs currently in any of the given states, newest first.
    async fn get_jobs(
        &self,
        states: &[QueueState],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    async fn is_paused(&self) -> Result<bool, StoreError>;

    /// Stop delivering jobs to workers. Queued jobs are still accepted.
    async fn pause(&self) -> Result<(), StoreError>;

    async fn resume(&self) -> Result<(), StoreError>;

    /// Remove jobs in `state` whose terminal timestamp is older than
    /// `grace`, returning the removed ids.
    async fn clean(&self, grace: TimeDelta, state: QueueState) -> Result<Vec<JobId>, StoreError>;

    async fn complete_job(&self, id: JobId, result: Value) -> Result<(), StoreError>;

    /// Record a failed attempt. The store either schedules a retry with the
    /// job's backoff or marks the job failed once attempts are exhausted.
    async fn fail_job(
        &self,
        id: JobId,
        reason: String,
        stacktrace: Vec<String>,
    ) -> Result<(), StoreError>;

    /// Put a failed job back on the queue for re-execution.
    async fn retry_job(&self, id: JobId) -> Result<(), StoreError>;

    async fn remove_job(&self, id: JobId) -> Result<(), StoreError>;

    async fn update_data(&self, id: JobId, data: Value) -> Result<(), StoreError>;

    async fn update_progress(&self, id: JobId, progress: JobProgress) -> Result<(), StoreError>;

    async fn append_log(&self, id: JobId, line: String) -> Result<(), StoreError>;

    /// Stream of jobs ready for execution. Each yielded job has already been
    /// marked active and had its attempt counter incremented.
    async fn subscribe_ready(&self) -> ReadyJobStream;

    fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent>;

    /// Stop background work owned by the queue (cron re-firing, ready
    /// streams). Idempotent.
    fn close(&self);
}
