//! An in memory implementation of [`Queue`].
//!
//! Provided as a correct (but not optimized) implementation, primarily for
//! tests and local development. Production deployments put a durable
//! backend behind the [`Queue`] trait instead.

use std::ops::Sub;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::{NewJob, Queue, QueueCounts, QueueEvent, ReadyJobStream, StoreError, StoredJob};
use crate::job::{JobId, JobProgress, QueueState, ResolvedJobOptions};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates [`InMemoryQueue`]s that share one id sequence, so job ids are
/// unique across every queue of the broker (the tracking index relies on
/// this).
#[derive(Clone)]
pub struct InMemoryBroker {
    counter: Arc<AtomicI64>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            counter: Arc::new(AtomicI64::new(1)),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, name: impl Into<String>) -> InMemoryQueue {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        InMemoryQueue {
            name: name.into(),
            jobs: Default::default(),
            counter: Arc::clone(&self.counter),
            paused: Default::default(),
            wakers: Default::default(),
            events,
            shutdown: CancellationToken::new(),
        }
    }
}

type Waker = mpsc::UnboundedSender<()>;

/// An in memory [`Queue`].
#[derive(Clone)]
pub struct InMemoryQueue {
    name: String,
    jobs: Arc<RwLock<Vec<StoredJob>>>,
    counter: Arc<AtomicI64>,
    paused: Arc<AtomicBool>,
    wakers: Arc<RwLock<Vec<Waker>>>,
    events: broadcast::Sender<QueueEvent>,
    shutdown: CancellationToken,
}

impl InMemoryQueue {
    /// Surface a queue-level error to event subscribers, the way a durable
    /// backend surfaces connection problems.
    pub fn report_error(&self, message: impl Into<String>) {
        let _ = self.events.send(QueueEvent::Error {
            message: message.into(),
        });
    }

    /// Requeue active jobs whose attempt started more than `grace` ago.
    /// Stands in for the stall detection a durable backend runs natively.
    pub fn requeue_stalled(&self, grace: TimeDelta) -> Result<Vec<JobId>, StoreError> {
        let now = Utc::now();
        let mut stalled = Vec::new();
        {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
            for job in jobs.iter_mut() {
                if job.state == QueueState::Active
                    && job.started_at.is_some_and(|started| started < now - grace)
                {
                    job.state = QueueState::Waiting;
                    job.scheduled_at = now;
                    stalled.push(job.id);
                }
            }
        }
        for id in &stalled {
            let _ = self.events.send(QueueEvent::Stalled { id: *id });
        }
        if !stalled.is_empty() {
            self.notify();
        }
        Ok(stalled)
    }

    fn notify(&self) {
        if let Ok(wakers) = self.wakers.read() {
            for waker in wakers.iter() {
                let _ = waker.send(());
            }
        }
    }

    /// The state a job reports to the outside, derived from its stored
    /// state, its eligibility time, and the queue's pause flag.
    fn effective_state(&self, job: &StoredJob, now: DateTime<Utc>) -> QueueState {
        match job.state {
            QueueState::Waiting if job.scheduled_at > now => QueueState::Delayed,
            QueueState::Waiting if self.paused.load(Ordering::Relaxed) => QueueState::Paused,
            other => other,
        }
    }

    fn snapshot(&self, job: &StoredJob, now: DateTime<Utc>) -> StoredJob {
        let mut snapshot = job.clone();
        snapshot.state = self.effective_state(job, now);
        snapshot
    }

    fn next_scheduled_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| job.state == QueueState::Waiting)
            .map(|job| job.scheduled_at)
            .min())
    }

    fn take_ready_job(&self) -> Result<Option<StoredJob>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut ready = jobs
            .iter_mut()
            .filter(|job| {
                job.state == QueueState::Waiting
                    && job.scheduled_at - now < TimeDelta::milliseconds(100)
            })
            .collect::<Vec<_>>();
        ready.sort_by(|a, b| {
            a.opts
                .priority
                .cmp(&b.opts.priority)
                .then(a.id.cmp(&b.id))
        });
        Ok(ready.first_mut().map(|job| {
            job.state = QueueState::Active;
            job.attempts_made += 1;
            job.started_at = Some(now);
            job.progress = JobProgress::default();
            job.clone()
        }))
    }

    /// Drop the oldest finished jobs in `state` beyond `limit`.
    fn apply_retention(jobs: &mut Vec<StoredJob>, state: QueueState, limit: Option<usize>) {
        let Some(limit) = limit else { return };
        let mut finished = jobs
            .iter()
            .filter(|job| job.state == state)
            .map(|job| (job.finished_at, job.id))
            .collect::<Vec<_>>();
        let excess = finished.len().saturating_sub(limit);
        if excess == 0 {
            return;
        }
        finished.sort();
        let doomed = finished
            .into_iter()
            .take(excess)
            .map(|(_, id)| id)
            .collect::<Vec<_>>();
        jobs.retain(|job| !doomed.contains(&job.id));
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, job: NewJob) -> Result<JobId, StoreError> {
        let id: JobId = self.counter.fetch_add(1, Ordering::SeqCst).into();
        self.jobs
            .write()
            .map_err(|_| StoreError::BadState)?
            .push(StoredJob {
                id,
                name: job.name,
                data: job.data,
                opts: job.opts,
                state: QueueState::Waiting,
                attempts_made: 0,
                progress: JobProgress::default(),
                logs: Vec::new(),
                failed_reason: None,
                stacktrace: Vec::new(),
                result: None,
                created_at: Utc::now(),
                scheduled_at: job.scheduled_at,
                started_at: None,
                finished_at: None,
            });
        self.notify();
        Ok(id)
    }

    async fn add_repeatable(
        &self,
        name: String,
        data: Value,
        cron_expr: &str,
        opts: ResolvedJobOptions,
    ) -> Result<(), StoreError> {
        let schedule = Schedule::from_str(cron_expr)
            .map_err(|_| StoreError::InvalidCron(cron_expr.to_owned()))?;
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if let Err(error) = queue
                            .add(NewJob {
                                name: name.clone(),
                                data: data.clone(),
                                opts: opts.clone(),
                                scheduled_at: next,
                            })
                            .await
                        {
                            tracing::error!(?error, "Failed to enqueue recurring job {name}: {error}");
                        }
                        let remaining = next - Utc::now();
                        if remaining > TimeDelta::zero() {
                            tokio::time::sleep(remaining.to_std().unwrap_or(Duration::ZERO)).await;
                        }
                    }
                    _ = queue.shutdown.cancelled() => break,
                }
            }
            tracing::debug!("Shutting down recurring job scheduler for {}", queue.name);
        });
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<StoredJob>, StoreError> {
        let now = Utc::now();
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .map(|job| self.snapshot(job, now)))
    }

    async fn get_jobs(
        &self,
        states: &[QueueState],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let now = Utc::now();
        let mut matching = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| states.contains(&self.effective_state(job, now)))
            .map(|job| self.snapshot(job, now))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let now = Utc::now();
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut counts = QueueCounts::default();
        for job in jobs.iter() {
            match self.effective_state(job, now) {
                QueueState::Waiting | QueueState::Paused | QueueState::Stuck => {
                    counts.waiting += 1
                }
                QueueState::Active => counts.active += 1,
                QueueState::Completed => counts.completed += 1,
                QueueState::Failed => counts.failed += 1,
                QueueState::Delayed => counts.delayed += 1,
            }
        }
        Ok(counts)
    }

    async fn is_paused(&self) -> Result<bool, StoreError> {
        Ok(self.paused.load(Ordering::Relaxed))
    }

    async fn pause(&self) -> Result<(), StoreError> {
        self.paused.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn resume(&self) -> Result<(), StoreError> {
        self.paused.store(false, Ordering::Relaxed);
        self.notify();
        Ok(())
    }

    async fn clean(&self, grace: TimeDelta, state: QueueState) -> Result<Vec<JobId>, StoreError> {
        let now = Utc::now();
        let cutoff = now - grace;
        let mut removed = Vec::new();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        jobs.retain(|job| {
            let reference = job.finished_at.unwrap_or(job.created_at);
            if self.effective_state(job, now) == state && reference < cutoff {
                removed.push(job.id);
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn complete_job(&self, id: JobId, result: Value) -> Result<(), StoreError> {
        let duration_ms;
        {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
            let job = jobs
                .iter_mut()
                .find(|job| job.id == id)
                .ok_or(StoreError::JobNotFound(id))?;
            job.state = QueueState::Completed;
            job.finished_at = Some(Utc::now());
            job.result = Some(result);
            duration_ms = job.duration_ms();
            let limit = job.opts.remove_on_complete.limit();
            Self::apply_retention(&mut jobs, QueueState::Completed, limit);
        }
        let _ = self.events.send(QueueEvent::Completed { id, duration_ms });
        Ok(())
    }

    async fn fail_job(
        &self,
        id: JobId,
        reason: String,
        stacktrace: Vec<String>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let attempts_made;
        let max_attempts;
        let will_retry;
        {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
            let job = jobs
                .iter_mut()
                .find(|job| job.id == id)
                .ok_or(StoreError::JobNotFound(id))?;
            job.failed_reason = Some(reason.clone());
            job.stacktrace.extend(stacktrace);
            attempts_made = job.attempts_made;
            max_attempts = job.opts.attempts;
            will_retry = attempts_made < max_attempts;
            if will_retry {
                job.state = QueueState::Waiting;
                let backoff = job.opts.backoff.delay_for(attempts_made);
                job.scheduled_at = now + TimeDelta::from_std(backoff).unwrap_or(TimeDelta::MAX);
            } else {
                job.state = QueueState::Failed;
                job.finished_at = Some(now);
                let limit = job.opts.remove_on_fail.limit();
                Self::apply_retention(&mut jobs, QueueState::Failed, limit);
            }
        }
        let _ = self.events.send(QueueEvent::Failed {
            id,
            attempts_made,
            max_attempts,
            reason,
        });
        if will_retry {
            self.notify();
        }
        Ok(())
    }

    async fn retry_job(&self, id: JobId) -> Result<(), StoreError> {
        {
            let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
            let job = jobs
                .iter_mut()
                .find(|job| job.id == id)
                .ok_or(StoreError::JobNotFound(id))?;
            if job.state != QueueState::Failed {
                return Err(StoreError::BadState);
            }
            job.state = QueueState::Waiting;
            job.scheduled_at = Utc::now();
            job.finished_at = None;
        }
        self.notify();
        Ok(())
    }

    async fn remove_job(&self, id: JobId) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let index = jobs
            .iter()
            .position(|job| job.id == id)
            .ok_or(StoreError::JobNotFound(id))?;
        jobs.remove(index);
        Ok(())
    }

    async fn update_data(&self, id: JobId, data: Value) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(StoreError::JobNotFound(id))?;
        job.data = data;
        Ok(())
    }

    async fn update_progress(&self, id: JobId, mut progress: JobProgress) -> Result<(), StoreError> {
        progress.percentage = progress.percentage.min(100);
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(StoreError::JobNotFound(id))?;
        job.progress = progress;
        Ok(())
    }

    async fn append_log(&self, id: JobId, line: String) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let job = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(StoreError::JobNotFound(id))?;
        job.logs.push(line);
        Ok(())
    }

    async fn subscribe_ready(&self) -> ReadyJobStream {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut wakers) = self.wakers.write() {
            wakers.push(sender);
        }
        let mut poller = ReadyPoller {
            queue: self.clone(),
            receiver,
        };
        Box::pin(stream! {
            loop {
                match poller.next_ready().await {
                    Ok(Some(job)) => yield Ok(job),
                    Ok(None) => break,
                    Err(error) => yield Err(error),
                }
            }
        })
    }

    fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    fn close(&self) {
        self.shutdown.cancel();
        self.notify();
    }
}

#[cfg(test)]
impl InMemoryQueue {
    pub(crate) fn jobs_for_tests(&self) -> std::sync::RwLockWriteGuard<'_, Vec<StoredJob>> {
        self.jobs.write().unwrap()
    }
}

struct ReadyPoller {
    queue: InMemoryQueue,
    receiver: mpsc::UnboundedReceiver<()>,
}

impl ReadyPoller {
    const DEFAULT_DELAY: Duration = Duration::from_secs(30);
    const DELTA: Duration = Duration::from_millis(15);

    async fn next_ready(&mut self) -> Result<Option<StoredJob>, StoreError> {
        loop {
            let paused = self.queue.paused.load(Ordering::Relaxed);
            let delay = if paused {
                Self::DEFAULT_DELAY
            } else {
                match self.queue.next_scheduled_at()? {
                    Some(timestamp) => timestamp
                        .sub(Utc::now())
                        .to_std()
                        .unwrap_or(Self::DELTA)
                        .min(Self::DEFAULT_DELAY),
                    None => Self::DEFAULT_DELAY,
                }
            };
            if !paused && delay <= Self::DELTA {
                if let Some(job) = self.queue.take_ready_job()? {
                    return Ok(Some(job));
                }
            }
            tokio::select! {
                _ = self.queue.shutdown.cancelled() => return Ok(None),
                _ = self.receiver.recv() => {},
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}
