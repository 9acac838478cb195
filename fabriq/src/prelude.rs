//! One-stop imports for working with the job engine.
//!
//! ```
//! # #![allow(unused_imports)]
//! use fabriq::prelude::*;
//! ```
pub use crate::dead_letter::{DeadLetterRecord, DEAD_LETTER_QUEUE};
pub use crate::job::{
    Backoff, BackoffKind, DefaultJobOptions, JobId, JobOptions, JobProgress, JobStatus,
    JobStatusView, JobType, QueueState, Retention,
};
pub use crate::metrics::{HealthReport, QueueMetrics};
pub use crate::processor::{
    ActiveJob, JobError, JobResult, Processor, ProcessorError, ServiceError,
};
pub use crate::store::{Queue, QueueCounts, QueueEvent, StoreError, StoredJob};
pub use crate::tenant::TenantContext;
pub use crate::tracking::{TrackingEntry, TrackingIndex};
pub use crate::{EngineConfig, EngineError, JobEngine, RetrySummary, TenantJobFilter};
