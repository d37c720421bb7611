use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jobq_core::{
    ConfigKey, DeadLetterEntry, DeadLetterId, ExecutionOutcome, Job, JobId, JobState, NewJob,
    QueueConfig, QueueError, QueueResult, Resolution,
};
use jobq_infra::{
    db, Clock, Executor, JobStore, ManualClock, Scheduler, SqliteJobStore, WorkerPool,
};

/// Executor driven by the command text: `ok ...` succeeds, `fail ...` exits 1,
/// `slow ...` succeeds after a pause, `nap ...` after a longer one.
#[derive(Default)]
struct ScriptedExecutor {
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, command: &str, _timeout: Duration) -> ExecutionOutcome {
        self.calls.lock().unwrap().push(command.to_string());
        if command.starts_with("slow") {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        if command.starts_with("nap") {
            tokio::time::sleep(Duration::from_millis(2500)).await;
        }
        if command.starts_with("fail") {
            ExecutionOutcome::failure(1, Some("exit status 1".into()), "nope")
        } else {
            ExecutionOutcome::success("ok")
        }
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig {
        poll_interval_ms: 10,
        ..QueueConfig::default()
    }
}

async fn sqlite_store() -> Arc<SqliteJobStore> {
    Arc::new(SqliteJobStore::new(db::connect_in_memory().await.unwrap()))
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap()
}

/// Re-read job `id` until `done` holds or five seconds pass.
async fn wait_for_job(
    scheduler: &Scheduler,
    id: &str,
    what: &str,
    done: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = job(scheduler, id).await;
        if done(&current) {
            return current;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn job(scheduler: &Scheduler, id: &str) -> Job {
    scheduler
        .get(&JobId::new(id).unwrap())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn successful_job_completes_in_one_cycle() {
    let scheduler = Scheduler::new(sqlite_store().await, fast_config());
    let executor = Arc::new(ScriptedExecutor::default());
    scheduler.enqueue(NewJob::new("hello", "ok echo hi")).await.unwrap();

    let handle = WorkerPool::new(scheduler.clone(), executor.clone(), 2)
        .with_host("test")
        .spawn();
    wait_for_job(&scheduler, "hello", "completion", |j| j.state == JobState::Completed).await;
    let stats = handle.shutdown().await;

    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(executor.calls(), ["ok echo hi"]);
    assert!(scheduler.list(JobState::Pending).await.unwrap().is_empty());
    assert!(scheduler.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn failing_job_is_retried_with_backoff_then_dead_lettered() {
    let clock = Arc::new(ManualClock::new(start()));
    let scheduler =
        Scheduler::new(sqlite_store().await, fast_config()).with_clock(clock.clone());
    scheduler
        .enqueue(
            NewJob::new("flaky", "fail always")
                .with_max_retries(2)
                .with_base_backoff(2),
        )
        .await
        .unwrap();

    let handle = WorkerPool::new(scheduler.clone(), Arc::new(ScriptedExecutor::default()), 3)
        .with_host("test")
        .spawn();

    let first = wait_for_job(&scheduler, "flaky", "first failure", |j| j.attempts == 1).await;
    assert_eq!(first.state, JobState::Failed);
    assert_eq!(first.next_run_at, Some(start() + chrono::Duration::seconds(2)));
    assert_eq!(
        first.last_error.as_deref(),
        Some("exit=1 err=exit status 1 out=nope")
    );

    clock.advance(chrono::Duration::seconds(2));
    let second = wait_for_job(&scheduler, "flaky", "second failure", |j| j.attempts == 2).await;
    assert_eq!(second.next_run_at, Some(clock.now() + chrono::Duration::seconds(4)));

    clock.advance(chrono::Duration::seconds(4));
    let dead_job =
        wait_for_job(&scheduler, "flaky", "dead letter", |j| j.state == JobState::Dead).await;
    let stats = handle.shutdown().await;

    assert_eq!(dead_job.attempts, 3);
    let dead = scheduler.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id.as_str(), "flaky-dlq");
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn single_worker_follows_priority_then_age() {
    let clock = Arc::new(ManualClock::new(start()));
    let scheduler =
        Scheduler::new(sqlite_store().await, fast_config()).with_clock(clock.clone());

    scheduler.enqueue(NewJob::new("C", "ok C").with_priority(1)).await.unwrap();
    clock.advance(chrono::Duration::seconds(1));
    scheduler.enqueue(NewJob::new("A", "ok A").with_priority(1)).await.unwrap();
    clock.advance(chrono::Duration::seconds(1));
    scheduler.enqueue(NewJob::new("B", "ok B").with_priority(0)).await.unwrap();

    let executor = Arc::new(ScriptedExecutor::default());
    let handle = WorkerPool::new(scheduler.clone(), executor.clone(), 1).spawn();
    let deadline = Instant::now() + Duration::from_secs(5);
    while executor.calls().len() < 3 {
        assert!(Instant::now() < deadline, "timed out waiting for all three jobs");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    assert_eq!(executor.calls(), ["ok B", "ok C", "ok A"]);
}

#[tokio::test]
async fn shutdown_lets_in_flight_jobs_finish() {
    let scheduler = Scheduler::new(sqlite_store().await, fast_config());
    scheduler.enqueue(NewJob::new("long", "slow job")).await.unwrap();

    let handle = WorkerPool::new(scheduler.clone(), Arc::new(ScriptedExecutor::default()), 2)
        .with_host("test")
        .spawn();
    wait_for_job(&scheduler, "long", "claim", |j| j.state == JobState::Processing).await;
    assert_eq!(scheduler.status().await.unwrap().workers.len(), 1);

    let stats = handle.shutdown().await;

    assert_eq!(stats.completed, 1);
    assert_eq!(job(&scheduler, "long").await.state, JobState::Completed);
}

#[tokio::test]
async fn job_outliving_a_short_lease_runs_once() {
    let config = QueueConfig {
        lease_seconds: 1,
        poll_interval_ms: 10,
        ..QueueConfig::default()
    };
    assert!(config.lease_is_raised());
    let scheduler = Scheduler::new(sqlite_store().await, config);
    let executor = Arc::new(ScriptedExecutor::default());
    scheduler.enqueue(NewJob::new("long", "nap for a while")).await.unwrap();

    let handle = WorkerPool::new(scheduler.clone(), executor.clone(), 2)
        .with_host("test")
        .spawn();
    let claimed =
        wait_for_job(&scheduler, "long", "claim", |j| j.state == JobState::Processing).await;
    wait_for_job(&scheduler, "long", "completion", |j| j.state == JobState::Completed).await;
    let stats = handle.shutdown().await;

    let leased_for = claimed.lease_expires_at.unwrap() - claimed.updated_at;
    assert!(leased_for >= chrono::Duration::seconds(40));
    assert_eq!(executor.calls(), ["nap for a while"]);
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);
}

/// Delegates to SQLite but fails the first few resolves with a store error.
struct FlakyResolveStore {
    inner: Arc<SqliteJobStore>,
    failures_left: AtomicU32,
}

#[async_trait]
impl JobStore for FlakyResolveStore {
    async fn upsert(&self, job: &Job) -> QueueResult<()> {
        self.inner.upsert(job).await
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        self.inner.get(id).await
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: chrono::Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        self.inner.claim_next(worker_id, lease, now).await
    }

    async fn resolve(
        &self,
        claimed: &Job,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> QueueResult<Resolution> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::store("disk I/O error"));
        }
        self.inner.resolve(claimed, outcome, now).await
    }

    async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<Job>> {
        self.inner.list_by_state(state).await
    }

    async fn state_counts(&self) -> QueueResult<BTreeMap<JobState, u64>> {
        self.inner.state_counts().await
    }

    async fn active_workers(&self) -> QueueResult<Vec<(String, u64)>> {
        self.inner.active_workers().await
    }

    async fn list_dead_letters(&self) -> QueueResult<Vec<DeadLetterEntry>> {
        self.inner.list_dead_letters().await
    }

    async fn get_dead_letter(&self, id: &DeadLetterId) -> QueueResult<Option<DeadLetterEntry>> {
        self.inner.get_dead_letter(id).await
    }

    async fn config_entries(&self) -> QueueResult<Vec<(String, String)>> {
        self.inner.config_entries().await
    }

    async fn set_config(&self, key: ConfigKey, value: &str) -> QueueResult<()> {
        self.inner.set_config(key, value).await
    }
}

#[tokio::test]
async fn transient_resolve_failures_are_retried() {
    let store = Arc::new(FlakyResolveStore {
        inner: sqlite_store().await,
        failures_left: AtomicU32::new(2),
    });
    let scheduler = Scheduler::new(store.clone(), fast_config());
    scheduler.enqueue(NewJob::new("sticky", "ok")).await.unwrap();

    let handle = WorkerPool::new(scheduler.clone(), Arc::new(ScriptedExecutor::default()), 1)
        .spawn();
    wait_for_job(&scheduler, "sticky", "completion", |j| j.state == JobState::Completed).await;
    let stats = handle.shutdown().await;

    assert_eq!(store.failures_left.load(Ordering::SeqCst), 0);
    assert_eq!(stats.claimed, 1);
    assert_eq!(stats.completed, 1);
}
