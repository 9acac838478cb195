//! Multi-tenant background job processing core.
//!
//! [`JobEngine`] owns one durable queue per [`job::JobType`] plus a
//! dead-letter queue, and drives the whole job lifecycle: submission,
//! delayed and recurring scheduling, retries with backoff, automatic
//! dead-letter escalation, cooperative cancellation, tenant-scoped lookup,
//! and on-demand queue metrics.
//!
//! The engine is generic over its [`store::Queue`] backend and its
//! [`tracking::TrackingIndex`]; the in-memory implementations back the test
//! suite and local development, while production deployments plug in a
//! durable store behind the same traits.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use fxhash::FxHashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod dead_letter;
pub mod job;
pub mod metrics;
pub mod prelude;
pub mod processor;
pub mod store;
pub mod tenant;
pub mod tracking;
pub(crate) mod worker;

use dead_letter::{DeadLetterRecord, SweepRunner, DEAD_LETTER_QUEUE};
use job::{
    DefaultJobOptions, JobId, JobOptions, JobStatus, JobStatusView, JobType, QueueState,
    UnknownJobType,
};
use metrics::{HealthReport, QueueHealth, QueueMetrics};
use processor::Processor;
use store::{NewJob, Queue, QueueEvent, StoreError, StoredJob};
use tenant::TenantContext;
use tracking::{TrackingEntry, TrackingIndex};
use worker::Worker;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no queue registered for job type `{0}`")]
    QueueNotFound(String),
    #[error("tenant id is required for job processing")]
    MissingTenant,
    #[error("job {id} is not in failed state (currently {actual})")]
    InvalidState { id: JobId, actual: JobStatus },
    #[error("job payload must be a JSON object")]
    InvalidPayload,
    #[error("error communicating with the queue store")]
    Store(#[from] StoreError),
    #[error("error encoding or decoding job data")]
    Encode(#[from] serde_json::Error),
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl From<UnknownJobType> for EngineError {
    fn from(error: UnknownJobType) -> Self {
        Self::QueueNotFound(error.0)
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_job_options: DefaultJobOptions,
    /// Cadence of the dead-letter inspection sweep.
    pub sweep_interval: Duration,
    /// Dead-letter records surfaced per sweep tick.
    pub sweep_batch: usize,
    /// Lifetime of job tracking entries.
    pub tracking_ttl: TimeDelta,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_job_options: DefaultJobOptions::default(),
            sweep_interval: Duration::from_secs(60),
            sweep_batch: 10,
            tracking_ttl: TimeDelta::days(7),
        }
    }
}

impl EngineConfig {
    pub fn with_default_job_options(mut self, options: DefaultJobOptions) -> Self {
        self.default_job_options = options;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_tracking_ttl(mut self, ttl: TimeDelta) -> Self {
        self.tracking_ttl = ttl;
        self
    }
}

/// Filters for [`JobEngine::jobs_by_tenant`].
#[derive(Debug, Clone, Default)]
pub struct TenantJobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
    /// Defaults to 100.
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Outcome of a bulk retry over a queue's failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySummary {
    pub total: usize,
    pub succeeded: usize,
}

/// The job lifecycle engine.
pub struct JobEngine<Q, T>
where
    Q: Queue,
    T: TrackingIndex,
{
    inner: Arc<EngineInner<Q, T>>,
    handles: Vec<JoinHandle<()>>,
}

struct EngineInner<Q, T> {
    /// Fixed queue map, built once at startup and never mutated.
    queues: FxHashMap<JobType, Arc<Q>>,
    dead_letter: Arc<Q>,
    tracking: T,
    config: EngineConfig,
    shutdown: CancellationToken,
}

impl<Q, T> JobEngine<Q, T>
where
    Q: Queue,
    T: TrackingIndex,
{
    /// Build the engine: one queue per job type plus the dead-letter queue,
    /// an event listener per queue, and the dead-letter sweep.
    pub fn new<F>(config: EngineConfig, tracking: T, mut make_queue: F) -> Self
    where
        F: FnMut(&str) -> Q,
    {
        let queues = JobType::ALL
            .into_iter()
            .map(|job_type| (job_type, Arc::new(make_queue(job_type.as_str()))))
            .collect::<FxHashMap<_, _>>();
        let dead_letter = Arc::new(make_queue(DEAD_LETTER_QUEUE));
        let shutdown = CancellationToken::new();
        let inner = Arc::new(EngineInner {
            queues,
            dead_letter,
            tracking,
            config,
            shutdown: shutdown.clone(),
        });

        let mut handles = Vec::new();
        for (&job_type, queue) in &inner.queues {
            handles.push(spawn_queue_listener(
                job_type,
                Arc::clone(queue),
                Arc::clone(&inner),
            ));
        }
        handles.push(
            SweepRunner::new(
                Arc::clone(&inner.dead_letter),
                inner.config.sweep_interval,
                inner.config.sweep_batch,
            )
            .spawn(shutdown),
        );

        Self { inner, handles }
    }

    /// Attach a processor; its worker drains the queue for `P::KIND`.
    pub fn with_processor<P>(mut self, processor: P) -> Self
    where
        P: Processor,
    {
        let queue = Arc::clone(
            self.inner
                .queues
                .get(&P::KIND)
                .expect("queue map covers every job type"),
        );
        let handle = Worker::new(queue, processor, self.inner.shutdown.clone()).spawn();
        self.handles.push(handle);
        self
    }

    /// Enqueue a job on the queue for its type.
    ///
    /// The payload must carry a `tenantId`, or one is taken from the ambient
    /// [`TenantContext`]. A `correlationId` is generated when absent.
    pub async fn submit(
        &self,
        job_type: JobType,
        data: Value,
        options: Option<JobOptions>,
    ) -> Result<JobStatusView, EngineError> {
        let queue = self.inner.queue(job_type)?;
        let (data, tenant_id) = self.inner.resolve_payload(data)?;
        let correlation_id = data
            .get("correlationId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let options = options.unwrap_or_default();
        let delay_ms = options.delay.unwrap_or(0);
        let opts = options.resolve(&self.inner.config.default_job_options);
        let now = Utc::now();
        let scheduled_at = now + TimeDelta::milliseconds(delay_ms as i64);

        let id = queue
            .add(NewJob {
                name: job_type.as_str().to_owned(),
                data,
                opts,
                scheduled_at,
            })
            .await?;

        // The job is already enqueued at this point; a missed tracking entry
        // only disables the fast-path lookup.
        if let Err(error) = self
            .inner
            .tracking
            .track(
                id,
                TrackingEntry {
                    job_type,
                    tenant_id: tenant_id.clone(),
                },
                self.inner.config.tracking_ttl,
            )
            .await
        {
            tracing::warn!(?error, job_id = %id, "Failed to record job tracking entry");
        }

        tracing::info!(
            job_id = %id,
            %job_type,
            %tenant_id,
            %correlation_id,
            "Job {id} of type {job_type} added to queue"
        );

        Ok(JobStatusView {
            job_id: id,
            job_type,
            status: if delay_ms > 0 {
                JobStatus::Delayed
            } else {
                JobStatus::Pending
            },
            created_at: now,
            started_at: None,
            finished_at: None,
            progress: Default::default(),
            attempts_made: 0,
            error: None,
            result: None,
            duration_ms: None,
        })
    }

    /// Enqueue a batch of jobs of one type.
    pub async fn submit_many(
        &self,
        job_type: JobType,
        batch: Vec<(Value, Option<JobOptions>)>,
    ) -> Result<Vec<JobStatusView>, EngineError> {
        let mut views = Vec::with_capacity(batch.len());
        for (data, options) in batch {
            views.push(self.submit(job_type, data, options).await?);
        }
        Ok(views)
    }

    /// Enqueue a job that becomes eligible only after `delay_ms`.
    pub async fn schedule(
        &self,
        job_type: JobType,
        data: Value,
        delay_ms: u64,
        options: Option<JobOptions>,
    ) -> Result<JobStatusView, EngineError> {
        let mut options = options.unwrap_or_default();
        options.delay = Some(delay_ms);
        self.submit(job_type, data, Some(options)).await
    }

    /// Register a recurring job; the store's cron engine re-fires it.
    pub async fn schedule_recurring(
        &self,
        job_type: JobType,
        data: Value,
        cron_expr: &str,
        options: Option<JobOptions>,
    ) -> Result<(), EngineError> {
        let queue = self.inner.queue(job_type)?;
        let (data, tenant_id) = self.inner.resolve_payload(data)?;
        let name = format!("{job_type}-recurring-{tenant_id}");
        let opts = options
            .unwrap_or_default()
            .resolve(&self.inner.config.default_job_options);
        queue
            .add_repeatable(name.clone(), data, cron_expr, opts)
            .await?;
        tracing::info!(%job_type, %tenant_id, "Recurring job {name} scheduled with cron: {cron_expr}");
        Ok(())
    }

    /// Current status of a job, or [`None`] if it exists nowhere.
    ///
    /// Resolution goes through the tracking index, falling back to a scan of
    /// the fixed queue set when the entry is absent or expired.
    pub async fn job_status(&self, id: JobId) -> Result<Option<JobStatusView>, EngineError> {
        Ok(self
            .inner
            .find_job(id)
            .await?
            .map(|(job_type, _, job)| JobStatusView::from_stored(&job, job_type)))
    }

    /// Cancel a job. A job mid-execution cannot be interrupted; it is marked
    /// `cancelled` for cooperating processors to notice. Any other job is
    /// removed outright. Returns `false` if the job does not exist.
    pub async fn cancel_job(&self, id: JobId) -> Result<bool, EngineError> {
        let Some((_, queue, job)) = self.inner.find_job(id).await? else {
            return Ok(false);
        };
        if job.state == QueueState::Active {
            let mut data = job.data;
            if let Value::Object(ref mut map) = data {
                map.insert("cancelled".to_owned(), Value::Bool(true));
            }
            match queue.update_data(id, data).await {
                Ok(()) => {
                    tracing::warn!(job_id = %id, "Job {id} marked for cancellation");
                    Ok(true)
                }
                Err(StoreError::JobNotFound(_)) => Ok(false),
                Err(error) => Err(error.into()),
            }
        } else {
            match queue.remove_job(id).await {
                Ok(()) => {
                    tracing::info!(job_id = %id, "Job {id} cancelled and removed");
                    Ok(true)
                }
                Err(StoreError::JobNotFound(_)) => Ok(false),
                Err(error) => Err(error.into()),
            }
        }
    }

    /// Put a failed job back on its queue. Fails with
    /// [`EngineError::InvalidState`] unless the job is currently `failed`;
    /// returns [`None`] if the job does not exist.
    pub async fn retry_job(&self, id: JobId) -> Result<Option<JobStatusView>, EngineError> {
        let Some((job_type, queue, job)) = self.inner.find_job(id).await? else {
            return Ok(None);
        };
        let actual = JobStatus::from(job.state);
        if actual != JobStatus::Failed {
            return Err(EngineError::InvalidState { id, actual });
        }
        queue.retry_job(id).await?;
        tracing::info!(job_id = %id, "Job {id} retried");
        Ok(queue
            .get_job(id)
            .await?
            .map(|job| JobStatusView::from_stored(&job, job_type)))
    }

    /// Retry up to `limit` failed jobs on one queue.
    pub async fn retry_failed_jobs(
        &self,
        job_type: JobType,
        limit: usize,
    ) -> Result<RetrySummary, EngineError> {
        let queue = self.inner.queue(job_type)?;
        let failed = queue.get_jobs(&[QueueState::Failed], 0, limit).await?;
        let total = failed.len();
        let mut succeeded = 0;
        for job in failed {
            match queue.retry_job(job.id).await {
                Ok(()) => succeeded += 1,
                Err(error) => {
                    tracing::warn!(?error, job_id = %job.id, "Failed to retry job {}", job.id);
                }
            }
        }
        tracing::info!(%job_type, "Retried {succeeded}/{total} failed jobs in {job_type}");
        Ok(RetrySummary { total, succeeded })
    }

    /// Move a job to the dead-letter queue, removing the original. No-op if
    /// the job does not exist.
    pub async fn move_to_dead_letter(&self, id: JobId, reason: &str) -> Result<(), EngineError> {
        let Some((_, queue, _)) = self.inner.find_job(id).await? else {
            return Ok(());
        };
        self.inner.dead_letter_from_queue(&queue, id, reason).await
    }

    /// Waiting dead-letter records, for operator inspection.
    pub async fn list_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, EngineError> {
        let jobs = self
            .inner
            .dead_letter
            .get_jobs(&[QueueState::Waiting], 0, limit)
            .await?;
        Ok(jobs
            .into_iter()
            .filter_map(|job| serde_json::from_value(job.data).ok())
            .collect())
    }

    pub async fn pause_queue(&self, job_type: JobType) -> Result<(), EngineError> {
        self.inner.queue(job_type)?.pause().await?;
        tracing::info!(%job_type, "Queue {job_type} paused");
        Ok(())
    }

    pub async fn resume_queue(&self, job_type: JobType) -> Result<(), EngineError> {
        self.inner.queue(job_type)?.resume().await?;
        tracing::info!(%job_type, "Queue {job_type} resumed");
        Ok(())
    }

    /// Remove terminal jobs older than `grace_ms` from one queue, per
    /// requested status (completed and failed by default). Returns the
    /// removed ids across all statuses.
    pub async fn clean_old_jobs(
        &self,
        job_type: JobType,
        grace_ms: u64,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Vec<JobId>, EngineError> {
        let queue = self.inner.queue(job_type)?;
        let statuses = statuses.unwrap_or(&[JobStatus::Completed, JobStatus::Failed]);
        let grace = TimeDelta::milliseconds(grace_ms as i64);
        let mut removed = Vec::new();
        for status in statuses {
            removed.extend(queue.clean(grace, status.nearest_queue_state()).await?);
        }
        tracing::info!(%job_type, "Cleaned {} jobs from {job_type} queue", removed.len());
        Ok(removed)
    }

    /// All of a tenant's jobs across the matching queues and states.
    ///
    /// This scans queue contents and filters by payload tenant id; fine at
    /// moderate scale, a documented scaling limit at high volume.
    pub async fn jobs_by_tenant(
        &self,
        tenant_id: &str,
        filter: TenantJobFilter,
    ) -> Result<Vec<JobStatusView>, EngineError> {
        let queues: Vec<(JobType, Arc<Q>)> = match filter.job_type {
            Some(job_type) => vec![(job_type, Arc::clone(self.inner.queue(job_type)?))],
            None => JobType::ALL
                .into_iter()
                .map(|job_type| Ok((job_type, Arc::clone(self.inner.queue(job_type)?))))
                .collect::<Result<_, EngineError>>()?,
        };
        let states: Vec<QueueState> = match filter.status {
            Some(status) => vec![status.nearest_queue_state()],
            None => vec![
                QueueState::Waiting,
                QueueState::Active,
                QueueState::Completed,
                QueueState::Failed,
                QueueState::Delayed,
                QueueState::Paused,
            ],
        };

        let mut views = Vec::new();
        for (job_type, queue) in queues {
            let jobs = queue.get_jobs(&states, 0, usize::MAX).await?;
            views.extend(
                jobs.iter()
                    .filter(|job| job.tenant_id() == Some(tenant_id))
                    .map(|job| JobStatusView::from_stored(job, job_type)),
            );
        }

        let limit = filter.limit.unwrap_or(100);
        Ok(views.into_iter().skip(filter.offset).take(limit).collect())
    }

    /// Metrics snapshot for one queue.
    pub async fn queue_metrics(&self, job_type: JobType) -> Result<QueueMetrics, EngineError> {
        Ok(metrics::for_queue(self.inner.queue(job_type)?.as_ref()).await?)
    }

    /// Metrics snapshots for every job queue (dead-letter excluded).
    pub async fn all_queue_metrics(&self) -> Result<Vec<QueueMetrics>, EngineError> {
        let mut all = Vec::with_capacity(JobType::ALL.len());
        for job_type in JobType::ALL {
            all.push(metrics::for_queue(self.inner.queue(job_type)?.as_ref()).await?);
        }
        Ok(all)
    }

    /// The system is healthy iff every queue is running and failing less
    /// than half of its finished jobs.
    pub async fn health_check(&self) -> Result<HealthReport, EngineError> {
        let all = self.all_queue_metrics().await?;
        let queues: Vec<QueueHealth> = all.iter().map(QueueHealth::from).collect();
        Ok(HealthReport {
            healthy: queues.iter().all(|queue| queue.healthy),
            queues,
        })
    }

    /// Stop listeners, workers, and the sweep, then close every queue.
    pub async fn graceful_shutdown(self) -> Result<(), EngineError> {
        tracing::debug!("Shutting down job engine tasks");
        self.inner.shutdown.cancel();
        for queue in self.inner.queues.values() {
            queue.close();
        }
        self.inner.dead_letter.close();
        let results = futures::future::join_all(self.handles).await;
        if results.iter().any(Result::is_err) {
            return Err(EngineError::GracefulShutdownFailed);
        }
        Ok(())
    }
}

impl<Q, T> EngineInner<Q, T>
where
    Q: Queue,
    T: TrackingIndex,
{
    fn queue(&self, job_type: JobType) -> Result<&Arc<Q>, EngineError> {
        self.queues
            .get(&job_type)
            .ok_or_else(|| EngineError::QueueNotFound(job_type.to_string()))
    }

    /// Ensure the payload is an object carrying `tenantId` and
    /// `correlationId`, resolving the tenant from the ambient context when
    /// the payload omits it.
    fn resolve_payload(&self, data: Value) -> Result<(Value, String), EngineError> {
        let Value::Object(mut map) = data else {
            return Err(EngineError::InvalidPayload);
        };
        let tenant_id = map
            .get("tenantId")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(TenantContext::current_tenant_id)
            .ok_or(EngineError::MissingTenant)?;
        map.insert("tenantId".to_owned(), Value::String(tenant_id.clone()));
        if !map.get("correlationId").is_some_and(Value::is_string) {
            map.insert(
                "correlationId".to_owned(),
                Value::String(job::generate_correlation_id()),
            );
        }
        Ok((Value::Object(map), tenant_id))
    }

    /// Resolve a job via the tracking index, scanning every queue when the
    /// index misses. O(queues) worst case, acceptable for the small fixed
    /// queue set.
    async fn find_job(
        &self,
        id: JobId,
    ) -> Result<Option<(JobType, Arc<Q>, StoredJob)>, EngineError> {
        if let Some(entry) = self.tracking.lookup(id).await {
            if let Some(queue) = self.queues.get(&entry.job_type) {
                if let Some(job) = queue.get_job(id).await? {
                    return Ok(Some((entry.job_type, Arc::clone(queue), job)));
                }
            }
        }
        for (&job_type, queue) in &self.queues {
            if let Some(job) = queue.get_job(id).await? {
                return Ok(Some((job_type, Arc::clone(queue), job)));
            }
        }
        Ok(None)
    }

    /// Snapshot the job into a dead-letter record, park it on the
    /// dead-letter queue, and remove the original.
    async fn dead_letter_from_queue(
        &self,
        queue: &Arc<Q>,
        id: JobId,
        reason: &str,
    ) -> Result<(), EngineError> {
        let Some(job) = queue.get_job(id).await? else {
            return Ok(());
        };
        let record = DeadLetterRecord::capture(&job, reason);
        let opts = JobOptions {
            attempts: Some(1),
            ..Default::default()
        }
        .resolve(&self.config.default_job_options);
        self.dead_letter
            .add(NewJob {
                name: "dead-letter".to_owned(),
                data: serde_json::to_value(&record)?,
                opts,
                scheduled_at: Utc::now(),
            })
            .await?;
        match queue.remove_job(id).await {
            Ok(()) | Err(StoreError::JobNotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        tracing::warn!(job_id = %id, "Job {id} moved to dead letter queue: {reason}");
        Ok(())
    }

    async fn handle_queue_event(&self, job_type: JobType, queue: &Arc<Q>, event: QueueEvent) {
        match event {
            QueueEvent::Completed { id, duration_ms } => {
                tracing::info!(
                    job_id = %id,
                    %job_type,
                    duration_ms,
                    "Job {id} of type {job_type} completed"
                );
            }
            QueueEvent::Failed {
                id,
                attempts_made,
                max_attempts,
                reason,
            } => {
                tracing::error!(
                    job_id = %id,
                    %job_type,
                    attempts_made,
                    %reason,
                    "Job {id} of type {job_type} failed"
                );
                // Automatic escalation once the store has exhausted the
                // job's attempts; earlier failures are left for its retry
                // cycle.
                if attempts_made >= max_attempts {
                    if let Err(error) = self
                        .dead_letter_from_queue(queue, id, "Max attempts reached")
                        .await
                    {
                        tracing::error!(
                            ?error,
                            job_id = %id,
                            "Failed to move job {id} to the dead letter queue"
                        );
                    }
                }
            }
            QueueEvent::Stalled { id } => {
                tracing::warn!(job_id = %id, %job_type, "Job {id} of type {job_type} stalled");
            }
            QueueEvent::Error { message } => {
                tracing::error!(%job_type, %message, "Queue {job_type} error");
            }
        }
    }
}

fn spawn_queue_listener<Q, T>(
    job_type: JobType,
    queue: Arc<Q>,
    inner: Arc<EngineInner<Q, T>>,
) -> JoinHandle<()>
where
    Q: Queue,
    T: TrackingIndex,
{
    tokio::spawn(async move {
        let mut events = queue.subscribe_events();
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => inner.handle_queue_event(job_type, &queue, event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(%job_type, missed, "Queue event listener lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::debug!("Shutting down queue listener for {job_type}");
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::job::Backoff;
    use crate::store::memory::{InMemoryBroker, InMemoryQueue};
    use crate::tracking::InMemoryTracking;
    use crate::worker::test::{scripted_payload, Outcome, ScriptedProcessor};

    type TestEngine = JobEngine<InMemoryQueue, InMemoryTracking>;

    fn engine_with_config(config: EngineConfig) -> TestEngine {
        let broker = InMemoryBroker::new();
        JobEngine::new(config, InMemoryTracking::new(), |name| broker.queue(name))
    }

    fn engine() -> TestEngine {
        engine_with_config(EngineConfig::default())
    }

    fn payload(tenant: &str) -> Value {
        json!({"tenantId": tenant, "fileId": "f1"})
    }

    fn quick_retry_options(attempts: u32) -> JobOptions {
        JobOptions {
            attempts: Some(attempts),
            backoff: Some(Backoff::fixed(1)),
            ..Default::default()
        }
    }

    async fn wait_for_status(engine: &TestEngine, id: JobId, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(view) = engine.job_status(id).await.unwrap() {
                    if view.status == status {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {status}"));
    }

    async fn wait_until_gone(engine: &TestEngine, id: JobId) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if engine.job_status(id).await.unwrap().is_none() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never left its queue"));
    }

    #[tokio::test]
    async fn submit_assigns_unique_ids_and_tracks_each_job() {
        let engine = engine();
        let mut ids = Vec::new();
        for job_type in [
            JobType::FileAnalysis,
            JobType::QuoteCalculation,
            JobType::FileAnalysis,
        ] {
            let view = engine.submit(job_type, payload("t1"), None).await.unwrap();
            assert_eq!(view.status, JobStatus::Pending);
            assert!(!ids.contains(&view.job_id));
            ids.push(view.job_id);
        }

        // Every submission leaves a tracking entry, so status lookups hit
        // the index instead of the scan fallback.
        for id in ids {
            let entry = engine.inner.tracking.lookup(id).await.unwrap();
            assert_eq!(entry.tenant_id, "t1");
            assert!(engine.job_status(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn submit_resolves_tenant_from_ambient_context() {
        let engine = engine();
        let view = TenantContext::new("ambient-tenant")
            .scope(engine.submit(JobType::FileAnalysis, json!({"fileId": "f1"}), None))
            .await
            .unwrap();

        let queue = &engine.inner.queues[&JobType::FileAnalysis];
        let job = queue.get_job(view.job_id).await.unwrap().unwrap();
        assert_eq!(job.tenant_id(), Some("ambient-tenant"));
    }

    #[tokio::test]
    async fn submit_without_any_tenant_fails() {
        let engine = engine();
        assert_matches!(
            engine
                .submit(JobType::FileAnalysis, json!({"fileId": "f1"}), None)
                .await,
            Err(EngineError::MissingTenant)
        );
    }

    #[tokio::test]
    async fn submit_rejects_non_object_payloads() {
        let engine = engine();
        assert_matches!(
            engine
                .submit(JobType::FileAnalysis, json!("just a string"), None)
                .await,
            Err(EngineError::InvalidPayload)
        );
    }

    #[tokio::test]
    async fn submit_generates_a_correlation_id_when_absent() {
        let engine = engine();
        let view = engine
            .submit(JobType::FileAnalysis, payload("t1"), None)
            .await
            .unwrap();

        let queue = &engine.inner.queues[&JobType::FileAnalysis];
        let job = queue.get_job(view.job_id).await.unwrap().unwrap();
        let correlation_id = job.data["correlationId"].as_str().unwrap();
        assert!(!correlation_id.is_empty());

        // An explicit correlation id is preserved.
        let view = engine
            .submit(
                JobType::FileAnalysis,
                json!({"tenantId": "t1", "correlationId": "corr-9"}),
                None,
            )
            .await
            .unwrap();
        let job = queue.get_job(view.job_id).await.unwrap().unwrap();
        assert_eq!(job.data["correlationId"], json!("corr-9"));
    }

    #[tokio::test]
    async fn submit_many_enqueues_the_whole_batch() {
        let engine = engine();
        let views = engine
            .submit_many(
                JobType::QuoteCalculation,
                vec![(payload("t1"), None), (payload("t1"), None)],
            )
            .await
            .unwrap();
        assert_eq!(views.len(), 2);
        assert_ne!(views[0].job_id, views[1].job_id);
    }

    #[tokio::test]
    async fn scheduled_jobs_report_delayed_until_eligible() {
        let engine = engine();
        let view = engine
            .schedule(JobType::EmailNotification, payload("t1"), 60_000, None)
            .await
            .unwrap();
        assert_eq!(view.status, JobStatus::Delayed);

        let view = engine.job_status(view.job_id).await.unwrap().unwrap();
        assert_eq!(view.status, JobStatus::Delayed);
    }

    #[tokio::test]
    async fn schedule_recurring_validates_the_cron_expression() {
        let engine = engine();
        assert_matches!(
            engine
                .schedule_recurring(JobType::ReportGeneration, payload("t1"), "bogus", None)
                .await,
            Err(EngineError::Store(StoreError::InvalidCron(_)))
        );
        engine
            .schedule_recurring(JobType::ReportGeneration, payload("t1"), "0 0 * * * *", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn job_status_returns_none_for_unknown_jobs() {
        let engine = engine();
        assert!(engine.job_status(JobId::from(404)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_status_falls_back_to_scanning_when_the_index_misses() {
        // A non-positive TTL expires tracking entries immediately, forcing
        // the scan fallback.
        let engine = engine_with_config(
            EngineConfig::default().with_tracking_ttl(TimeDelta::milliseconds(-1)),
        );
        let view = engine
            .submit(JobType::QuoteCalculation, payload("t1"), None)
            .await
            .unwrap();

        assert!(engine.inner.tracking.lookup(view.job_id).await.is_none());
        let found = engine.job_status(view.job_id).await.unwrap().unwrap();
        assert_eq!(found.job_type, JobType::QuoteCalculation);
    }

    #[tokio::test]
    async fn cancel_removes_a_pending_job() {
        let engine = engine();
        let view = engine
            .submit(JobType::FileAnalysis, payload("t1"), None)
            .await
            .unwrap();

        assert!(engine.cancel_job(view.job_id).await.unwrap());
        assert!(engine.job_status(view.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_marks_a_processing_job_instead_of_removing_it() {
        let engine = engine().with_processor(ScriptedProcessor);
        let view = engine
            .submit(
                JobType::FileAnalysis,
                scripted_payload("t1", Outcome::Sleep { millis: 60_000 }),
                None,
            )
            .await
            .unwrap();
        wait_for_status(&engine, view.job_id, JobStatus::Processing).await;

        assert!(engine.cancel_job(view.job_id).await.unwrap());

        let queue = &engine.inner.queues[&JobType::FileAnalysis];
        let job = queue.get_job(view.job_id).await.unwrap().unwrap();
        assert!(job.is_cancelled());
        assert_eq!(job.state, QueueState::Active);
    }

    #[tokio::test]
    async fn cancel_returns_false_for_unknown_jobs() {
        let engine = engine();
        assert!(!engine.cancel_job(JobId::from(404)).await.unwrap());
    }

    #[tokio::test]
    async fn retry_rejects_jobs_that_are_not_failed() {
        let engine = engine();
        let view = engine
            .submit(JobType::FileAnalysis, payload("t1"), None)
            .await
            .unwrap();

        assert_matches!(
            engine.retry_job(view.job_id).await,
            Err(EngineError::InvalidState {
                actual: JobStatus::Pending,
                ..
            })
        );
    }

    #[tokio::test]
    async fn retry_returns_none_for_unknown_jobs() {
        let engine = engine();
        assert!(engine.retry_job(JobId::from(404)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_failed_jobs_reports_an_empty_summary_when_nothing_failed() {
        let engine = engine();
        let summary = engine
            .retry_failed_jobs(JobType::FileAnalysis, 100)
            .await
            .unwrap();
        assert_eq!(
            summary,
            RetrySummary {
                total: 0,
                succeeded: 0
            }
        );
    }

    #[tokio::test]
    async fn exhausted_jobs_are_escalated_to_the_dead_letter_queue() {
        let engine = engine().with_processor(ScriptedProcessor);
        let view = engine
            .submit(
                JobType::FileAnalysis,
                scripted_payload("t1", Outcome::Throw),
                Some(quick_retry_options(1)),
            )
            .await
            .unwrap();

        // With attempts=1 the first failure is final: the original is
        // removed and exactly one dead-letter record references it.
        wait_until_gone(&engine, view.job_id).await;
        let records = engine.list_dead_letters(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].original_job.id, view.job_id);
        assert_eq!(records[0].reason, "Max attempts reached");
        assert_eq!(records[0].original_job.attempts_made, 1);
    }

    #[tokio::test]
    async fn failing_jobs_are_retried_before_escalation() {
        let engine = engine().with_processor(ScriptedProcessor);
        let view = engine
            .submit(
                JobType::FileAnalysis,
                scripted_payload("t1", Outcome::Throw),
                Some(quick_retry_options(2)),
            )
            .await
            .unwrap();

        wait_until_gone(&engine, view.job_id).await;
        let records = engine.list_dead_letters(10).await.unwrap();
        assert_eq!(records.len(), 1);
        // Two attempts were made before the job was dead-lettered.
        assert_eq!(records[0].original_job.attempts_made, 2);
    }

    #[tokio::test]
    async fn operator_dead_lettering_removes_the_original() {
        let engine = engine();
        let view = engine
            .submit(JobType::FileAnalysis, payload("t1"), None)
            .await
            .unwrap();

        engine
            .move_to_dead_letter(view.job_id, "operator request")
            .await
            .unwrap();

        assert!(engine.job_status(view.job_id).await.unwrap().is_none());
        let records = engine.list_dead_letters(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "operator request");

        // Dead-lettering an already-moved job is a no-op.
        engine
            .move_to_dead_letter(view.job_id, "again")
            .await
            .unwrap();
        assert_eq!(engine.list_dead_letters(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn paused_queue_accepts_jobs_but_defers_execution() {
        let engine = engine().with_processor(ScriptedProcessor);
        engine.pause_queue(JobType::FileAnalysis).await.unwrap();

        let view = engine
            .submit(
                JobType::FileAnalysis,
                scripted_payload("t1", Outcome::Succeed),
                None,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = engine.job_status(view.job_id).await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Pending);

        let metrics = engine.queue_metrics(JobType::FileAnalysis).await.unwrap();
        assert!(metrics.paused);

        engine.resume_queue(JobType::FileAnalysis).await.unwrap();
        wait_for_status(&engine, view.job_id, JobStatus::Completed).await;
    }

    #[tokio::test]
    async fn clean_removes_only_requested_terminal_statuses() {
        let engine = engine().with_processor(ScriptedProcessor);
        let view = engine
            .submit(
                JobType::FileAnalysis,
                scripted_payload("t1", Outcome::Succeed),
                None,
            )
            .await
            .unwrap();
        wait_for_status(&engine, view.job_id, JobStatus::Completed).await;

        let removed = engine
            .clean_old_jobs(JobType::FileAnalysis, 86_400_000, None)
            .await
            .unwrap();
        assert!(removed.is_empty());

        let removed = engine
            .clean_old_jobs(JobType::FileAnalysis, 0, Some(&[JobStatus::Failed]))
            .await
            .unwrap();
        assert!(removed.is_empty());

        let removed = engine
            .clean_old_jobs(JobType::FileAnalysis, 0, Some(&[JobStatus::Completed]))
            .await
            .unwrap();
        assert_eq!(removed, vec![view.job_id]);
    }

    #[tokio::test]
    async fn jobs_by_tenant_never_leaks_other_tenants() {
        let engine = engine();
        let mut tenant_a = Vec::new();
        for job_type in [
            JobType::FileAnalysis,
            JobType::FileAnalysis,
            JobType::EmailNotification,
        ] {
            tenant_a.push(
                engine
                    .submit(job_type, payload("tenant-a"), None)
                    .await
                    .unwrap()
                    .job_id,
            );
        }
        for _ in 0..2 {
            engine
                .submit(JobType::FileAnalysis, payload("tenant-b"), None)
                .await
                .unwrap();
        }

        let views = engine
            .jobs_by_tenant("tenant-a", TenantJobFilter::default())
            .await
            .unwrap();
        assert_eq!(views.len(), 3);
        assert!(views.iter().all(|view| tenant_a.contains(&view.job_id)));

        let views = engine
            .jobs_by_tenant(
                "tenant-a",
                TenantJobFilter {
                    job_type: Some(JobType::FileAnalysis),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(views.len(), 2);

        let views = engine
            .jobs_by_tenant(
                "tenant-a",
                TenantJobFilter {
                    status: Some(JobStatus::Pending),
                    limit: Some(1),
                    offset: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert!(tenant_a.contains(&views[0].job_id));
    }

    #[tokio::test]
    async fn metrics_cover_every_queue_and_feed_the_health_check() {
        let engine = engine();
        let all = engine.all_queue_metrics().await.unwrap();
        assert_eq!(all.len(), JobType::ALL.len());
        for metrics in &all {
            assert_eq!(metrics.completed_rate, 0.0);
            assert_eq!(metrics.failed_rate, 0.0);
        }

        let health = engine.health_check().await.unwrap();
        assert!(health.healthy);

        engine.pause_queue(JobType::QuoteCalculation).await.unwrap();
        let health = engine.health_check().await.unwrap();
        assert!(!health.healthy);
        let unhealthy = health
            .queues
            .iter()
            .find(|queue| queue.name == "quote-calculation")
            .unwrap();
        assert!(!unhealthy.healthy);
    }

    #[tokio::test]
    async fn business_failures_surface_in_the_status_view_error() {
        let engine = engine().with_processor(ScriptedProcessor);
        let view = engine
            .submit(
                JobType::FileAnalysis,
                scripted_payload("t1", Outcome::BusinessFail),
                None,
            )
            .await
            .unwrap();

        wait_for_status(&engine, view.job_id, JobStatus::Completed).await;
        let status = engine.job_status(view.job_id).await.unwrap().unwrap();
        assert_eq!(status.error.as_deref(), Some("input can never succeed"));
        assert_eq!(status.attempts_made, 1);
        assert!(status.duration_ms.is_some());
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_all_engine_tasks() {
        let engine = engine().with_processor(ScriptedProcessor);
        engine
            .submit(
                JobType::FileAnalysis,
                scripted_payload("t1", Outcome::Succeed),
                None,
            )
            .await
            .unwrap();
        engine.graceful_shutdown().await.unwrap();
    }
}
