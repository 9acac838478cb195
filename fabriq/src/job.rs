//! The job data model: identifiers, types, statuses, options, and the
//! status-view surfaced to callers.
//!
//! Statuses come in two flavours. [`QueueState`] is the state a job has
//! inside the queue store, [`JobStatus`] is the state reported to callers.
//! The two mapping functions between them are exhaustive matches so that
//! adding a state is a compile-time-checked change.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoredJob;

/// Store-assigned job identifier, unique across all queues of one broker.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kinds of background work the platform runs. Each maps 1:1 to a queue.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    FileAnalysis,
    QuoteCalculation,
    EmailNotification,
    ReportGeneration,
}

impl JobType {
    /// Every job type, in queue-construction order.
    pub const ALL: [JobType; 4] = [
        JobType::FileAnalysis,
        JobType::QuoteCalculation,
        JobType::EmailNotification,
        JobType::ReportGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FileAnalysis => "file-analysis",
            JobType::QuoteCalculation => "quote-calculation",
            JobType::EmailNotification => "email-notification",
            JobType::ReportGeneration => "report-generation",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown job type `{0}`")]
pub struct UnknownJobType(pub String);

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownJobType(s.to_owned()))
    }
}

/// A job's state as held by the queue store.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Paused,
    Stuck,
}

impl QueueState {
    pub const ALL: [QueueState; 7] = [
        QueueState::Waiting,
        QueueState::Active,
        QueueState::Completed,
        QueueState::Failed,
        QueueState::Delayed,
        QueueState::Paused,
        QueueState::Stuck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Waiting => "waiting",
            QueueState::Active => "active",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
            QueueState::Delayed => "delayed",
            QueueState::Paused => "paused",
            QueueState::Stuck => "stuck",
        }
    }
}

impl Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job's state as reported to callers.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Delayed,
    Stalled,
    Stuck,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Delayed,
        JobStatus::Stalled,
        JobStatus::Stuck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Stalled => "stalled",
            JobStatus::Stuck => "stuck",
        }
    }

    /// Closest [`QueueState`] for filtering jobs by a desired status.
    ///
    /// The store has no native "stalled" or "stuck" filter, so those map to
    /// `failed` and `waiting` as best-effort approximations.
    pub fn nearest_queue_state(&self) -> QueueState {
        match self {
            JobStatus::Pending => QueueState::Waiting,
            JobStatus::Processing => QueueState::Active,
            JobStatus::Completed => QueueState::Completed,
            JobStatus::Failed => QueueState::Failed,
            JobStatus::Delayed => QueueState::Delayed,
            JobStatus::Stalled => QueueState::Failed,
            JobStatus::Stuck => QueueState::Waiting,
        }
    }
}

impl From<QueueState> for JobStatus {
    fn from(state: QueueState) -> Self {
        match state {
            QueueState::Waiting => JobStatus::Pending,
            QueueState::Active => JobStatus::Processing,
            QueueState::Completed => JobStatus::Completed,
            QueueState::Failed => JobStatus::Failed,
            QueueState::Delayed => JobStatus::Delayed,
            QueueState::Paused => JobStatus::Pending,
            QueueState::Stuck => JobStatus::Stuck,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl Backoff {
    pub const fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay: delay_ms,
        }
    }

    pub const fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: delay_ms,
        }
    }

    /// Delay before re-running a job whose `attempt`th execution failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                self.delay.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Retention policy for jobs that reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Retention {
    /// Keep at most this many jobs, pruning the oldest first.
    KeepLast(u32),
    /// `true` removes the job as soon as it finishes, `false` keeps all.
    Remove(bool),
}

impl Retention {
    /// Maximum number of finished jobs to keep, `None` meaning unbounded.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Retention::KeepLast(n) => Some(*n as usize),
            Retention::Remove(true) => Some(0),
            Retention::Remove(false) => None,
        }
    }
}

/// Caller-supplied job options. Anything left unset falls back to the
/// engine defaults at enqueue time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Delay before the job becomes eligible for execution, in milliseconds.
    pub delay: Option<u64>,
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub remove_on_complete: Option<Retention>,
    pub remove_on_fail: Option<Retention>,
    /// Lower values run first within a queue.
    pub priority: Option<i32>,
    /// Upper bound on a single execution attempt, in milliseconds.
    pub timeout: Option<u64>,
}

impl JobOptions {
    pub fn resolve(&self, defaults: &DefaultJobOptions) -> ResolvedJobOptions {
        ResolvedJobOptions {
            attempts: self.attempts.unwrap_or(defaults.attempts),
            backoff: self.backoff.unwrap_or(defaults.backoff),
            remove_on_complete: self
                .remove_on_complete
                .unwrap_or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.unwrap_or(defaults.remove_on_fail),
            priority: self.priority.unwrap_or(0),
            timeout: self.timeout,
        }
    }
}

/// Queue-level defaults applied to jobs that don't bring their own options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefaultJobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
}

impl Default for DefaultJobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::exponential(5000),
            remove_on_complete: Retention::KeepLast(100),
            remove_on_fail: Retention::KeepLast(1000),
        }
    }
}

/// Fully-resolved options as stored alongside the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedJobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
    pub priority: i32,
    pub timeout: Option<u64>,
}

/// Mutable progress of a processing job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    /// 0–100.
    pub percentage: u8,
    pub message: Option<String>,
    pub step: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl JobProgress {
    pub fn at(percentage: u8) -> Self {
        Self {
            percentage: percentage.min(100),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

/// Point-in-time view of a job, as returned by status and listing calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub attempts_made: u32,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
}

impl JobStatusView {
    pub(crate) fn from_stored(job: &StoredJob, job_type: JobType) -> Self {
        // Business failures returned as `{success: false}` complete the job;
        // surface their message in `error` alongside infrastructure failures.
        let result_error = job
            .result
            .as_ref()
            .filter(|r| r.get("success").and_then(serde_json::Value::as_bool) == Some(false))
            .and_then(|r| r.pointer("/error/message"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        Self {
            job_id: job.id,
            job_type,
            status: job.state.into(),
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            progress: job.progress.clone(),
            attempts_made: job.attempts_made,
            error: job.failed_reason.clone().or(result_error),
            result: job.result.clone(),
            duration_ms: job.duration_ms(),
        }
    }
}

/// Opaque id threaded through a job's payload for cross-system tracing.
pub(crate) fn generate_correlation_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("{}-{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_is_total() {
        for state in QueueState::ALL {
            let status = JobStatus::from(state);
            assert!(JobStatus::ALL.contains(&status));
        }
        for status in JobStatus::ALL {
            let state = status.nearest_queue_state();
            assert!(QueueState::ALL.contains(&state));
        }
    }

    #[test]
    fn status_mapping_pairs() {
        assert_eq!(JobStatus::from(QueueState::Waiting), JobStatus::Pending);
        assert_eq!(JobStatus::from(QueueState::Paused), JobStatus::Pending);
        assert_eq!(JobStatus::from(QueueState::Active), JobStatus::Processing);
        assert_eq!(JobStatus::from(QueueState::Stuck), JobStatus::Stuck);

        assert_eq!(
            JobStatus::Stalled.nearest_queue_state(),
            QueueState::Failed
        );
        assert_eq!(JobStatus::Stuck.nearest_queue_state(), QueueState::Waiting);
        assert_eq!(
            JobStatus::Pending.nearest_queue_state(),
            QueueState::Waiting
        );
    }

    #[test]
    fn job_type_round_trips_through_str() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>(), Ok(job_type));
        }
        assert_eq!(
            "pdf-rendering".parse::<JobType>(),
            Err(UnknownJobType("pdf-rendering".to_owned()))
        );
    }

    #[test]
    fn options_resolve_over_defaults() {
        let defaults = DefaultJobOptions::default();

        let resolved = JobOptions::default().resolve(&defaults);
        assert_eq!(resolved.attempts, 3);
        assert_eq!(resolved.backoff, Backoff::exponential(5000));
        assert_eq!(resolved.remove_on_complete, Retention::KeepLast(100));
        assert_eq!(resolved.remove_on_fail, Retention::KeepLast(1000));
        assert_eq!(resolved.priority, 0);
        assert_eq!(resolved.timeout, None);

        let resolved = JobOptions {
            attempts: Some(1),
            backoff: Some(Backoff::fixed(250)),
            priority: Some(2),
            timeout: Some(30_000),
            ..Default::default()
        }
        .resolve(&defaults);
        assert_eq!(resolved.attempts, 1);
        assert_eq!(resolved.backoff, Backoff::fixed(250));
        assert_eq!(resolved.priority, 2);
        assert_eq!(resolved.timeout, Some(30_000));
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::exponential(5000);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(5000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(10_000));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(20_000));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(1000);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(7), Duration::from_millis(1000));
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_overflowing() {
        let backoff = Backoff::exponential(u64::MAX / 2);
        assert_eq!(backoff.delay_for(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn retention_deserializes_from_bool_or_number() {
        assert_eq!(
            serde_json::from_str::<Retention>("100").unwrap(),
            Retention::KeepLast(100)
        );
        assert_eq!(
            serde_json::from_str::<Retention>("true").unwrap(),
            Retention::Remove(true)
        );
        assert_eq!(Retention::KeepLast(5).limit(), Some(5));
        assert_eq!(Retention::Remove(true).limit(), Some(0));
        assert_eq!(Retention::Remove(false).limit(), None);
    }

    #[test]
    fn job_options_use_wire_field_names() {
        let options: JobOptions = serde_json::from_str(
            r#"{
                "delay": 1000,
                "attempts": 5,
                "backoff": {"type": "exponential", "delay": 2000},
                "removeOnComplete": 10,
                "removeOnFail": false
            }"#,
        )
        .unwrap();
        assert_eq!(options.delay, Some(1000));
        assert_eq!(options.attempts, Some(5));
        assert_eq!(options.backoff, Some(Backoff::exponential(2000)));
        assert_eq!(options.remove_on_complete, Some(Retention::KeepLast(10)));
        assert_eq!(options.remove_on_fail, Some(Retention::Remove(false)));
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert_ne!(a, b);
        assert_eq!(a.split('-').count(), 2);
        assert_eq!(a.split('-').nth(1).unwrap().len(), 9);
    }
}
