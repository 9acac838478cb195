//! Dead-letter records and the periodic inspection sweep.
//!
//! Jobs that permanently fail are snapshotted into a [`DeadLetterRecord`]
//! and parked on a dedicated queue for manual inspection. Nothing retries
//! them automatically. A background sweep surfaces waiting records in the
//! logs so operators notice them; alerting hooks would go there.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::job::{JobId, QueueState, ResolvedJobOptions};
use crate::store::{Queue, StoredJob};

pub const DEAD_LETTER_QUEUE: &str = "dead-letter-queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_job: OriginalJob,
    pub reason: String,
    pub moved_at: DateTime<Utc>,
}

/// Snapshot of the failed job at the moment it was dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalJob {
    pub id: JobId,
    pub name: String,
    pub data: Value,
    pub opts: ResolvedJobOptions,
    pub failed_reason: Option<String>,
    pub stacktrace: Vec<String>,
    pub attempts_made: u32,
}

impl DeadLetterRecord {
    pub fn capture(job: &StoredJob, reason: impl Into<String>) -> Self {
        Self {
            original_job: OriginalJob {
                id: job.id,
                name: job.name.clone(),
                data: job.data.clone(),
                opts: job.opts.clone(),
                failed_reason: job.failed_reason.clone(),
                stacktrace: job.stacktrace.clone(),
                attempts_made: job.attempts_made,
            },
            reason: reason.into(),
            moved_at: Utc::now(),
        }
    }
}

/// Periodic sweep over the dead-letter queue, owned by the engine and
/// cancelled at shutdown.
pub(crate) struct SweepRunner<Q> {
    queue: Arc<Q>,
    interval: Duration,
    batch: usize,
}

impl<Q> SweepRunner<Q>
where
    Q: Queue,
{
    pub(crate) fn new(queue: Arc<Q>, interval: Duration, batch: usize) -> Self {
        Self {
            queue,
            interval,
            batch,
        }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the sweep runs on
            // the configured cadence from startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep().await,
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the dead-letter sweep");
                        break;
                    }
                }
            }
        })
    }

    async fn sweep(&self) {
        let jobs = match self
            .queue
            .get_jobs(&[QueueState::Waiting], 0, self.batch)
            .await
        {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::error!(?error, "Failed to sweep dead-letter queue: {error}");
                return;
            }
        };
        for job in jobs {
            match serde_json::from_value::<DeadLetterRecord>(job.data.clone()) {
                Ok(record) => tracing::warn!(
                    original_job_id = %record.original_job.id,
                    reason = %record.reason,
                    "Dead letter job awaiting inspection"
                ),
                Err(_) => tracing::warn!(
                    dead_letter_id = %job.id,
                    "Dead letter job with unreadable record awaiting inspection"
                ),
            }
        }
    }
}
