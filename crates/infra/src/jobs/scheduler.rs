//! Scheduling operations on top of a [`JobStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use jobq_core::{
    DeadLetterEntry, DeadLetterId, ExecutionOutcome, Job, JobId, JobState, NewJob, QueueConfig,
    QueueError, QueueResult, Resolution,
};

use super::clock::{Clock, SystemClock};
use super::store::JobStore;

/// Queue overview: jobs per state and in-flight jobs per worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub counts: BTreeMap<JobState, u64>,
    pub workers: Vec<(String, u64)>,
}

/// Enqueue, claim, resolve and dead-letter retry.
///
/// Holds no job state of its own; the store is the single source of truth.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate and upsert a job as pending, replacing any job with the same id.
    #[instrument(skip(self, new), fields(job_id = %new.id), err)]
    pub async fn enqueue(&self, new: NewJob) -> QueueResult<Job> {
        let job = new.into_job(&self.config, self.clock.now())?;
        self.store.upsert(&job).await?;
        info!(
            job_id = %job.id,
            priority = job.priority,
            max_retries = job.max_retries,
            run_at = %job.run_at,
            "job enqueued"
        );
        Ok(job)
    }

    /// Claim the best eligible job for `worker_id`.
    pub async fn claim_next(&self, worker_id: &str, lease: Duration) -> QueueResult<Job> {
        self.store
            .claim_next(worker_id, lease, self.clock.now())
            .await
    }

    /// Record the outcome of the attempt begun by the claim that returned
    /// `claimed`.
    pub async fn resolve(
        &self,
        claimed: &Job,
        outcome: &ExecutionOutcome,
    ) -> QueueResult<Resolution> {
        let resolution = self
            .store
            .resolve(claimed, outcome, self.clock.now())
            .await?;
        let id = &claimed.id;
        let worker_id = claimed.worker_id.as_deref().unwrap_or_default();

        match &resolution {
            Resolution::Completed => {
                info!(job_id = %id, worker_id, "job completed");
            }
            Resolution::Retry {
                attempts,
                delay,
                last_error,
                ..
            } => {
                warn!(
                    job_id = %id,
                    worker_id,
                    attempts,
                    delay_secs = delay.as_secs(),
                    last_error = %last_error,
                    "job failed; retry scheduled"
                );
            }
            Resolution::DeadLetter {
                attempts,
                last_error,
            } => {
                error!(
                    job_id = %id,
                    worker_id,
                    attempts,
                    last_error = %last_error,
                    "job moved to dead-letter queue"
                );
            }
        }

        Ok(resolution)
    }

    /// Resubmit a dead-lettered command as a fresh job.
    ///
    /// The entry stays in place; repeating the call overwrites the same
    /// derived job.
    #[instrument(skip(self), fields(dlq_id = %id), err)]
    pub async fn retry_dead_letter(&self, id: &DeadLetterId) -> QueueResult<Job> {
        let entry = self
            .store
            .get_dead_letter(id)
            .await?
            .ok_or_else(|| QueueError::not_found(format!("dead-letter entry {id}")))?;

        let job = self.enqueue(entry.resubmission()).await?;
        info!(dlq_id = %id, job_id = %job.id, "dead-letter entry resubmitted");
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.store.get(id).await
    }

    pub async fn list(&self, state: JobState) -> QueueResult<Vec<Job>> {
        self.store.list_by_state(state).await
    }

    pub async fn status(&self) -> QueueResult<QueueStatus> {
        Ok(QueueStatus {
            counts: self.store.state_counts().await?,
            workers: self.store.active_workers().await?,
        })
    }

    pub async fn dead_letters(&self) -> QueueResult<Vec<DeadLetterEntry>> {
        self.store.list_dead_letters().await
    }
}
