//! Job store abstraction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use jobq_core::{
    ConfigKey, DeadLetterEntry, DeadLetterId, ExecutionOutcome, Job, JobId, JobState, QueueResult,
    Resolution,
};

/// Persistent source of truth for jobs, dead letters and config.
///
/// Every operation is one transaction. Implementations never cache job state
/// between calls; each decision re-reads the row it acts on.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job`, replacing any existing job with the same id.
    async fn upsert(&self, job: &Job) -> QueueResult<()>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Reserve the best eligible job for `worker_id` until `now + lease`.
    ///
    /// Returns `NoJobAvailable` when nothing is eligible and `Contention`
    /// when another claimer got there first.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Job>;

    /// Record the outcome of the attempt started by the claim that returned
    /// `claimed`.
    ///
    /// Fails with `LeaseLost` if the job has since been reclaimed, re-enqueued
    /// or resolved, even by a worker with the same id.
    async fn resolve(
        &self,
        claimed: &Job,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> QueueResult<Resolution>;

    /// Jobs in `state`, oldest first.
    async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<Job>>;

    /// Number of jobs per state; every state is present.
    async fn state_counts(&self) -> QueueResult<BTreeMap<JobState, u64>>;

    /// Processing jobs per worker id.
    async fn active_workers(&self) -> QueueResult<Vec<(String, u64)>>;

    async fn list_dead_letters(&self) -> QueueResult<Vec<DeadLetterEntry>>;

    async fn get_dead_letter(&self, id: &DeadLetterId) -> QueueResult<Option<DeadLetterEntry>>;

    /// Raw config rows, sorted by key.
    async fn config_entries(&self) -> QueueResult<Vec<(String, String)>>;

    /// Persist one already-validated config value.
    async fn set_config(&self, key: ConfigKey, value: &str) -> QueueResult<()>;
}
