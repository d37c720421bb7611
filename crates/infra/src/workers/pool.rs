//! Worker pool: N concurrent claim → execute → resolve loops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobq_core::{ExecutionOutcome, Job, QueueError, Resolution};
use sysinfo::System;

use crate::executor::Executor;
use crate::jobs::Scheduler;

/// Pause after a lost claim race or a store error.
pub const CONTENTION_BACKOFF: Duration = Duration::from_millis(200);

/// Resolve attempts a cancelled worker makes before leaving the job to lease
/// expiry.
const SHUTDOWN_RESOLVE_ATTEMPTS: u32 = 25;

/// Pool counters, readable while the pool runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub claim_errors: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    claim_errors: AtomicU64,
}

impl StatsCounters {
    fn record(&self, resolution: &Resolution) {
        let counter = match resolution {
            Resolution::Completed => &self.completed,
            Resolution::Retry { .. } => &self.retried,
            Resolution::DeadLetter { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            claimed: self.claimed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            claim_errors: self.claim_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a pool started with [`WorkerPool::spawn`].
#[derive(Debug)]
pub struct WorkerPoolHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<StatsCounters>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Cancel all workers and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> PoolStats {
        self.token.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "worker pool task failed");
        }
        self.stats.snapshot()
    }
}

/// A fixed-size pool of workers sharing one scheduler and executor.
pub struct WorkerPool {
    scheduler: Scheduler,
    executor: Arc<dyn Executor>,
    size: usize,
    host: String,
    stats: Arc<StatsCounters>,
}

impl WorkerPool {
    /// `size` below one is treated as one.
    pub fn new(scheduler: Scheduler, executor: Arc<dyn Executor>, size: usize) -> Self {
        Self {
            scheduler,
            executor,
            size: size.max(1),
            host: host_name(),
            stats: Arc::new(StatsCounters::default()),
        }
    }

    /// Override the host part of worker ids.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Worker identities, `<host>-<index>`.
    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.size)
            .map(|index| format!("{}-{}", self.host, index))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Run every worker until `token` is cancelled and all have exited.
    pub async fn run(&self, token: CancellationToken) {
        let config = self.scheduler.config();
        if config.lease_is_raised() {
            warn!(
                configured_lease_secs = config.lease_seconds,
                lease_secs = config.effective_lease_seconds(),
                job_timeout_secs = config.job_timeout_seconds,
                "lease shorter than job timeout; raising it so running jobs are not reclaimed"
            );
        }
        info!(
            workers = self.size,
            lease_secs = config.effective_lease_seconds(),
            job_timeout_secs = config.job_timeout_seconds,
            poll_interval_ms = config.poll_interval_ms,
            "worker pool started"
        );

        let mut workers = JoinSet::new();
        for id in self.worker_ids() {
            let worker = Worker {
                id,
                scheduler: self.scheduler.clone(),
                executor: Arc::clone(&self.executor),
                stats: Arc::clone(&self.stats),
            };
            workers.spawn(worker.run(token.clone()));
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }

        let stats = self.stats.snapshot();
        info!(
            claimed = stats.claimed,
            completed = stats.completed,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            "worker pool stopped"
        );
    }

    /// Run the pool on a background task.
    pub fn spawn(self) -> WorkerPoolHandle {
        let token = CancellationToken::new();
        let stats = Arc::clone(&self.stats);
        let run_token = token.clone();
        let join = tokio::spawn(async move { self.run(run_token).await });

        WorkerPoolHandle { token, join, stats }
    }
}

struct Worker {
    id: String,
    scheduler: Scheduler,
    executor: Arc<dyn Executor>,
    stats: Arc<StatsCounters>,
}

impl Worker {
    async fn run(self, token: CancellationToken) {
        let config = *self.scheduler.config();
        let lease = config.lease();
        let timeout = config.job_timeout();
        let poll_interval = config.poll_interval();

        debug!(worker_id = %self.id, "worker started");

        while !token.is_cancelled() {
            match self.scheduler.claim_next(&self.id, lease).await {
                Ok(job) => {
                    self.stats.claimed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        job_id = %job.id,
                        worker_id = %self.id,
                        attempts = job.attempts,
                        "executing job"
                    );
                    let outcome = self.executor.run(&job.command, timeout).await;
                    self.resolve(&job, &outcome, &token).await;
                }
                Err(QueueError::NoJobAvailable) => idle(&token, poll_interval).await,
                Err(err) => {
                    self.stats.claim_errors.fetch_add(1, Ordering::Relaxed);
                    if err.is_transient() {
                        debug!(worker_id = %self.id, error = %err, "claim failed; backing off");
                    } else {
                        error!(worker_id = %self.id, error = %err, "claim failed");
                    }
                    idle(&token, CONTENTION_BACKOFF).await;
                }
            }
        }

        debug!(worker_id = %self.id, "worker stopped");
    }

    /// Record the outcome, retrying transient store failures.
    async fn resolve(&self, job: &Job, outcome: &ExecutionOutcome, token: &CancellationToken) {
        let id = &job.id;
        let mut attempts_after_cancel = 0;
        loop {
            match self.scheduler.resolve(job, outcome).await {
                Ok(resolution) => {
                    self.stats.record(&resolution);
                    return;
                }
                Err(err) if err.is_transient() => {
                    if token.is_cancelled() {
                        attempts_after_cancel += 1;
                        if attempts_after_cancel >= SHUTDOWN_RESOLVE_ATTEMPTS {
                            error!(
                                job_id = %id,
                                worker_id = %self.id,
                                error = %err,
                                "giving up on recording outcome; \
                                 job will be reclaimed when its lease expires"
                            );
                            return;
                        }
                    }
                    warn!(
                        job_id = %id,
                        worker_id = %self.id,
                        error = %err,
                        "failed to record outcome; retrying"
                    );
                    tokio::time::sleep(CONTENTION_BACKOFF).await;
                }
                Err(err) => {
                    warn!(job_id = %id, worker_id = %self.id, error = %err, "outcome discarded");
                    return;
                }
            }
        }
    }
}

/// Sleep for `period`, waking early on cancellation.
async fn idle(token: &CancellationToken, period: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(period) => {}
    }
}

/// This machine's host name, for worker identities.
pub fn host_name() -> String {
    System::host_name()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
