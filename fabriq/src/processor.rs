//! The lifecycle contract shared by every job processor.
//!
//! A processor consumes an [`ActiveJob`], reports progress at logical
//! milestones, and finishes one of two ways:
//!
//! - returning `Ok(JobResult)`: the job completes, even when the result
//!   carries `success: false`. Permanent business failures take this path so
//!   the store does not burn retries on inputs that can never succeed.
//! - returning `Err(ProcessorError)`: an infrastructure failure. This path
//!   engages the store's attempt/backoff cycle and, past the last attempt,
//!   dead-letter escalation.
//!
//! Long-running steps should also check [`ActiveJob::is_cancelled`] at safe
//! checkpoints and abort cooperatively.

use std::error::Error;
use std::fmt::Display;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;

use crate::job::{JobId, JobProgress, JobType};
use crate::store::StoreError;

pub mod email_notification;
pub mod file_analysis;
pub mod quote_calculation;
pub mod report_generation;

/// One handler per job type.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// The queue this processor drains.
    const KIND: JobType;

    /// The typed payload carried by jobs of this kind.
    type Data: DeserializeOwned + Send + 'static;

    async fn process(&self, job: ActiveJob<Self::Data>) -> Result<JobResult, ProcessorError>;
}

/// Store operations an in-flight job can perform on itself.
#[async_trait]
pub(crate) trait JobContext: Send + Sync {
    async fn update_progress(&self, progress: JobProgress) -> Result<(), StoreError>;
    async fn append_log(&self, line: String) -> Result<(), StoreError>;
    async fn current_data(&self) -> Result<Option<Value>, StoreError>;
}

/// A job handed to a processor for execution.
pub struct ActiveJob<D> {
    id: JobId,
    data: D,
    attempts_made: u32,
    context: Box<dyn JobContext>,
}

impl<D> ActiveJob<D> {
    pub(crate) fn new(id: JobId, data: D, attempts_made: u32, context: Box<dyn JobContext>) -> Self {
        Self {
            id,
            data,
            attempts_made,
            context,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// Record a progress milestone on the job and its append-only log.
    ///
    /// Store unavailability must not fail the job over a progress update, so
    /// errors are logged and swallowed here.
    pub async fn report_progress(&self, percentage: u8, message: &str, step: &str) {
        let progress = JobProgress::at(percentage)
            .with_message(message)
            .with_step(step);
        if let Err(error) = self.context.update_progress(progress).await {
            tracing::debug!(?error, job_id = %self.id, "Failed to update job progress");
        }
        let line = format!("{message} ({percentage}%)");
        if let Err(error) = self.context.append_log(line).await {
            tracing::debug!(?error, job_id = %self.id, "Failed to append job log");
        }
    }

    /// Whether the job has been marked for cancellation since it started.
    ///
    /// Cancellation is advisory; a lookup failure reads as "not cancelled".
    pub async fn is_cancelled(&self) -> bool {
        match self.context.current_data().await {
            Ok(Some(data)) => data.get("cancelled").and_then(Value::as_bool) == Some(true),
            _ => false,
        }
    }
}

/// The result every processor returns on its non-throwing path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
}

impl JobResult {
    pub fn success(data: Value, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration_ms,
        }
    }

    /// A permanent business failure: the job completes carrying the error,
    /// and the store will not retry it.
    pub fn failure(error: JobError, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            duration_ms,
        }
    }
}

/// Structured error carried inside a `{success: false}` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// An infrastructure failure thrown out of a processor, subject to the
/// store's attempt/backoff policy.
#[derive(Debug)]
pub struct ProcessorError {
    kind: &'static str,
    message: String,
}

impl ProcessorError {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl Error for ProcessorError {}

impl From<serde_json::Error> for ProcessorError {
    fn from(error: serde_json::Error) -> Self {
        Self::new("encode", error.to_string())
    }
}

pub(crate) fn elapsed_ms(started: std::time::Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Errors reported by the external services processors call out to.
#[derive(Debug, ThisError)]
pub enum ServiceError {
    /// The service cannot be reached at all.
    #[error("service unreachable: {0}")]
    Unavailable(String),
    /// The service answered and rejected the request.
    #[error("{code}: {message}")]
    Failed { code: String, message: String },
}
