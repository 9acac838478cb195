//! The job tracking index.
//!
//! A side key-value index mapping a job id to the queue that holds it and
//! the tenant that owns it, so lookups don't have to scan every queue.
//! Entries expire after a TTL and are never updated; a missed lookup is not
//! an error, callers fall back to scanning the (small, fixed) queue set.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobType};
use crate::store::StoreError;

pub(crate) fn tracking_key(id: JobId) -> String {
    format!("job-tracking:{id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEntry {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub tenant_id: String,
}

#[async_trait]
pub trait TrackingIndex: Send + Sync + 'static {
    async fn track(
        &self,
        id: JobId,
        entry: TrackingEntry,
        ttl: TimeDelta,
    ) -> Result<(), StoreError>;

    /// Plain read, no side effects. Returns [`None`] for absent or expired
    /// entries; backend unavailability also degrades to [`None`].
    async fn lookup(&self, id: JobId) -> Option<TrackingEntry>;
}

/// An in memory [`TrackingIndex`] with lazy expiry.
#[derive(Clone, Default)]
pub struct InMemoryTracking {
    entries: Arc<RwLock<FxHashMap<String, (TrackingEntry, DateTime<Utc>)>>>,
}

impl InMemoryTracking {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackingIndex for InMemoryTracking {
    async fn track(
        &self,
        id: JobId,
        entry: TrackingEntry,
        ttl: TimeDelta,
    ) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::BadState)?
            .insert(tracking_key(id), (entry, Utc::now() + ttl));
        Ok(())
    }

    async fn lookup(&self, id: JobId) -> Option<TrackingEntry> {
        let entries = self.entries.read().ok()?;
        let (entry, expires_at) = entries.get(&tracking_key(id))?;
        if *expires_at <= Utc::now() {
            return None;
        }
        Some(entry.clone())
    }
}
