//! On-demand queue metrics aggregation.
//!
//! Snapshots are never persisted; each call derives counts and rates from
//! the queue's current state and averages processing time over the most
//! recent completed jobs.

use serde::Serialize;

use crate::job::QueueState;
use crate::store::{Queue, StoreError};

/// Number of recent completed jobs sampled for the processing-time average.
const PROCESSING_TIME_SAMPLE: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub name: String,
    pub waiting: u32,
    pub active: u32,
    pub completed: u32,
    pub failed: u32,
    pub delayed: u32,
    pub paused: bool,
    /// Percentage of finished jobs that completed, 0 when none finished.
    pub completed_rate: f64,
    /// Percentage of finished jobs that failed, 0 when none finished.
    pub failed_rate: f64,
    pub avg_processing_time_ms: f64,
}

impl QueueMetrics {
    /// A queue is healthy while it is running and failing less than half of
    /// its finished jobs.
    pub fn is_healthy(&self) -> bool {
        !self.paused && self.failed_rate < 50.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub queues: Vec<QueueHealth>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub name: String,
    pub healthy: bool,
    pub paused: bool,
    pub failed_rate: f64,
}

impl From<&QueueMetrics> for QueueHealth {
    fn from(metrics: &QueueMetrics) -> Self {
        Self {
            name: metrics.name.clone(),
            healthy: metrics.is_healthy(),
            paused: metrics.paused,
            failed_rate: metrics.failed_rate,
        }
    }
}

pub(crate) async fn for_queue<Q: Queue>(queue: &Q) -> Result<QueueMetrics, StoreError> {
    let (counts, paused) = tokio::try_join!(queue.counts(), queue.is_paused())?;

    let finished = f64::from(counts.completed) + f64::from(counts.failed);
    let (completed_rate, failed_rate) = if finished > 0.0 {
        (
            f64::from(counts.completed) / finished * 100.0,
            f64::from(counts.failed) / finished * 100.0,
        )
    } else {
        (0.0, 0.0)
    };

    let recent = queue
        .get_jobs(&[QueueState::Completed], 0, PROCESSING_TIME_SAMPLE)
        .await?;
    // Jobs completed before duration instrumentation lack a timestamp pair
    // and are skipped.
    let samples = recent
        .iter()
        .filter_map(|job| job.duration_ms())
        .collect::<Vec<_>>();
    let avg_processing_time_ms = if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<i64>() as f64 / samples.len() as f64
    };

    Ok(QueueMetrics {
        name: queue.name().to_owned(),
        waiting: counts.waiting,
        active: counts.active,
        completed: counts.completed,
        failed: counts.failed,
        delayed: counts.delayed,
        paused,
        completed_rate,
        failed_rate,
        avg_processing_time_ms,
    })
}
