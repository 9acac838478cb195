//! Per-queue execution loop.
//!
//! A worker drains its queue's ready-job stream and runs one processor over
//! each job. The processor's two-way contract is routed into the store
//! here: a returned [`JobResult`] completes the job (whatever its `success`
//! flag says), while a returned error, a timeout, or a panic records a
//! failed attempt and leaves retry scheduling to the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::job::{JobId, JobProgress};
use crate::processor::{ActiveJob, JobContext, JobResult, Processor};
use crate::store::{Queue, StoreError, StoredJob};

pub(crate) struct Worker<Q, P> {
    queue: Arc<Q>,
    processor: Arc<P>,
    shutdown: CancellationToken,
}

impl<Q, P> Worker<Q, P>
where
    Q: Queue,
    P: Processor,
{
    pub(crate) fn new(queue: Arc<Q>, processor: P, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut stream = self.queue.subscribe_ready().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(job)) => self.execute(job).await,
                    Some(Err(error)) => {
                        tracing::error!(?error, queue = self.queue.name(), "Failed to pull ready job: {error}");
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Shutting down worker for {}", P::KIND);
    }

    async fn execute(&self, job: StoredJob) {
        let job_id = job.id;
        let timeout = job.opts.timeout.map(Duration::from_millis);

        let data: P::Data = match serde_json::from_value(job.data.clone()) {
            Ok(data) => data,
            Err(error) => {
                tracing::error!(?error, %job_id, "Failed to decode job payload: {error}");
                self.fail(job_id, format!("invalid payload: {error}")).await;
                return;
            }
        };
        let context = StoreJobContext {
            queue: Arc::clone(&self.queue),
            id: job_id,
        };
        let active = ActiveJob::new(job_id, data, job.attempts_made, Box::new(context));

        tracing::debug!(%job_id, "Executing job {job_id}");
        let handle = tokio::spawn({
            let processor = Arc::clone(&self.processor);
            async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, processor.process(active)).await,
                    None => Ok(processor.process(active).await),
                }
            }
        });

        match handle.await {
            Ok(Ok(Ok(result))) => self.complete(job_id, result).await,
            Ok(Ok(Err(error))) => self.fail(job_id, error.to_string()).await,
            Ok(Err(_elapsed)) => {
                let limit = timeout.unwrap_or_default();
                self.fail(
                    job_id,
                    format!("Job failed to complete within timeout: {limit:?}"),
                )
                .await;
            }
            Err(join_error) => {
                self.fail(job_id, format!("panic: {}", panic_message(join_error)))
                    .await;
            }
        }
    }

    async fn complete(&self, job_id: JobId, result: JobResult) {
        let success = result.success;
        let value = match serde_json::to_value(&result) {
            Ok(value) => value,
            Err(error) => {
                self.fail(job_id, format!("unencodable result: {error}")).await;
                return;
            }
        };
        tracing::debug!(%job_id, success, "Job complete {job_id}");
        let _ = self
            .queue
            .complete_job(job_id, value)
            .await
            .inspect_err(|err| {
                tracing::error!(?err, %job_id, "Failed to mark job {job_id} as complete: {err:?}");
            });
    }

    async fn fail(&self, job_id: JobId, reason: String) {
        tracing::warn!(%job_id, %reason, "Job {job_id} attempt failed");
        let _ = self
            .queue
            .fail_job(job_id, reason, Vec::new())
            .await
            .inspect_err(|err| {
                tracing::error!(?err, %job_id, "Failed to record failed attempt for job {job_id}: {err:?}");
            });
    }
}

struct StoreJobContext<Q> {
    queue: Arc<Q>,
    id: JobId,
}

#[async_trait]
impl<Q: Queue> JobContext for StoreJobContext<Q> {
    async fn update_progress(&self, progress: JobProgress) -> Result<(), StoreError> {
        self.queue.update_progress(self.id, progress).await
    }

    async fn append_log(&self, line: String) -> Result<(), StoreError> {
        self.queue.append_log(self.id, line).await
    }

    async fn current_data(&self) -> Result<Option<Value>, StoreError> {
        Ok(self.queue.get_job(self.id).await?.map(|job| job.data))
    }
}

fn panic_message(error: JoinError) -> String {
    let message = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(message),
        Err(_) => message,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::job::JobType;
    use crate::processor::{JobError, ProcessorError};

    /// A processor whose behaviour is scripted by the job payload.
    pub(crate) struct ScriptedProcessor;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct ScriptedJobData {
        pub tenant_id: String,
        pub correlation_id: Option<String>,
        pub outcome: Outcome,
        #[serde(default)]
        pub cancelled: bool,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub(crate) enum Outcome {
        Succeed,
        BusinessFail,
        Throw,
        Panic,
        Sleep { millis: u64 },
    }

    pub(crate) fn scripted_payload(tenant: &str, outcome: Outcome) -> serde_json::Value {
        serde_json::json!({
            "tenantId": tenant,
            "outcome": serde_json::to_value(outcome).unwrap(),
        })
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        const KIND: JobType = JobType::FileAnalysis;
        type Data = ScriptedJobData;

        async fn process(&self, job: ActiveJob<Self::Data>) -> Result<JobResult, ProcessorError> {
            job.report_progress(50, "Working", "working").await;
            match job.data().outcome.clone() {
                Outcome::Succeed => Ok(JobResult::success(
                    serde_json::json!({"echo": job.data().tenant_id}),
                    1,
                )),
                Outcome::BusinessFail => Ok(JobResult::failure(
                    JobError::new("BAD_INPUT", "input can never succeed"),
                    1,
                )),
                Outcome::Throw => Err(ProcessorError::new("downstream", "dependency offline")),
                Outcome::Panic => panic!("processor exploded"),
                Outcome::Sleep { millis } => {
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    Ok(JobResult::success(serde_json::json!({}), millis))
                }
            }
        }
    }
}
