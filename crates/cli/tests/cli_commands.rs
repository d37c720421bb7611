use std::path::Path;

use chrono::Duration;
use clap::Parser;
use jobq_cli::cli::Cli;
use jobq_cli::{open_store, pidfile};
use jobq_core::{ExecutionOutcome, JobId, JobState, QueueConfig};
use jobq_infra::{JobStore, Scheduler};
use tempfile::TempDir;

/// Run one `jobq` invocation against `db` and return what it printed.
async fn jobq(db: &Path, args: &[&str]) -> anyhow::Result<String> {
    let db = db.to_string_lossy().into_owned();
    let argv = ["jobq", "--db", db.as_str()].into_iter().chain(args.iter().copied());
    let cli = Cli::try_parse_from(argv)?;

    let mut out = Vec::new();
    jobq_cli::run(cli, &mut out).await?;
    Ok(String::from_utf8(out)?)
}

fn temp_db() -> (TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    (dir, path)
}

#[tokio::test]
async fn enqueue_then_list_pending() {
    let (_dir, db) = temp_db();

    let out = jobq(&db, &["enqueue", "--id", "job1", "--cmd", "echo Hello"]).await.unwrap();
    assert_eq!(out, "Job job1 enqueued\n");
    let out = jobq(&db, &["enqueue", r#"{"id":"job2","command":"sleep 5","priority":-1}"#])
        .await
        .unwrap();
    assert_eq!(out, "Job job2 enqueued\n");

    let out = jobq(&db, &["list"]).await.unwrap();
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "Jobs in state: pending");
    assert_eq!(lines.len(), 4);
    assert!(lines[2].starts_with("job1 "));
    assert!(lines[2].ends_with("(pending) attempts=0/3"));
    assert!(lines[3].starts_with("job2 "));

    let out = jobq(&db, &["list", "--state", "dead"]).await.unwrap();
    assert_eq!(out.lines().count(), 2);
}

#[tokio::test]
async fn invalid_enqueue_is_rejected() {
    let (_dir, db) = temp_db();

    assert!(jobq(&db, &["enqueue", "--id", "x"]).await.is_err());
    assert!(jobq(&db, &["enqueue", "{broken"]).await.is_err());
    assert!(
        jobq(&db, &["enqueue", "--id", "x", "--cmd", "true", "--run-at", "soon"])
            .await
            .is_err()
    );

    let out = jobq(&db, &["status"]).await.unwrap();
    assert!(out.contains("pending    : 0"));
}

#[tokio::test]
async fn status_reports_counts_and_workers() {
    let (_dir, db) = temp_db();
    jobq(&db, &["enqueue", "--id", "a", "--cmd", "true"]).await.unwrap();
    jobq(&db, &["enqueue", "--id", "b", "--cmd", "true"]).await.unwrap();

    let out = jobq(&db, &["status"]).await.unwrap();
    assert!(out.contains("pending    : 2"));
    assert!(out.contains("(none)"));

    let scheduler = Scheduler::new(open_store(&db).await.unwrap(), QueueConfig::default());
    scheduler.claim_next("host-0", Duration::seconds(60)).await.unwrap();

    let out = jobq(&db, &["status"]).await.unwrap();
    assert!(out.contains("pending    : 1"));
    assert!(out.contains("processing : 1"));
    assert!(out.contains("host-0     : 1"));
}

#[tokio::test]
async fn dead_letter_can_be_listed_and_retried() {
    let (_dir, db) = temp_db();
    jobq(&db, &["enqueue", "--id", "doomed", "--cmd", "exit 3", "--max-retries", "1"])
        .await
        .unwrap();

    let scheduler = Scheduler::new(open_store(&db).await.unwrap(), QueueConfig::default());
    let failure = ExecutionOutcome::failure(3, Some("exit status: 3".into()), "");
    let job = scheduler.claim_next("w", Duration::seconds(60)).await.unwrap();
    scheduler.resolve(&job, &failure).await.unwrap();

    make_due(&scheduler, "doomed").await;
    let job = scheduler.claim_next("w", Duration::seconds(60)).await.unwrap();
    scheduler.resolve(&job, &failure).await.unwrap();

    let out = jobq(&db, &["dlq", "list"]).await.unwrap();
    assert!(out.contains("doomed-dlq"));
    assert!(out.contains("[2 attempts]"));

    let out = jobq(&db, &["dlq", "retry", "doomed-dlq"]).await.unwrap();
    assert_eq!(out, "Retried dead-letter entry doomed-dlq as job doomed-retry\n");

    let retried = scheduler
        .get(&JobId::new("doomed-retry").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.state, JobState::Pending);
    assert_eq!(retried.command, "exit 3");

    assert!(jobq(&db, &["dlq", "retry", "missing-dlq"]).await.is_err());
}

/// Pull a failed job's retry time into the past instead of sleeping out the backoff.
async fn make_due(scheduler: &Scheduler, id: &str) {
    let mut job = scheduler
        .get(&JobId::new(id).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    job.next_run_at = Some(chrono::Utc::now() - Duration::seconds(1));
    scheduler.store().upsert(&job).await.unwrap();
}

#[tokio::test]
async fn config_get_and_set() {
    let (_dir, db) = temp_db();

    let out = jobq(&db, &["config", "get"]).await.unwrap();
    assert!(out.contains("max_retries = 3"));
    assert!(out.contains("backoff_base = 2"));

    let out = jobq(&db, &["config", "set", "max_retries", " 5 "]).await.unwrap();
    assert_eq!(out, "Set max_retries = 5\n");
    let out = jobq(&db, &["config", "get"]).await.unwrap();
    assert!(out.contains("max_retries = 5"));

    jobq(&db, &["enqueue", "--id", "j", "--cmd", "true"]).await.unwrap();
    let out = jobq(&db, &["list"]).await.unwrap();
    assert!(out.contains("attempts=0/5"));

    assert!(jobq(&db, &["config", "set", "nope", "1"]).await.is_err());
    assert!(jobq(&db, &["config", "set", "lease_seconds", "0"]).await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn worker_stop_signals_registered_processes() {
    use std::os::unix::process::ExitStatusExt;

    let (_dir, db) = temp_db();
    assert_eq!(jobq(&db, &["worker", "stop"]).await.unwrap(), "No running workers\n");

    let mut worker = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    std::fs::create_dir_all(pidfile::registry_dir(&db)).unwrap();
    std::fs::write(pidfile::record_path(&db, worker.id()), "").unwrap();

    let out = jobq(&db, &["worker", "stop"]).await.unwrap();
    assert_eq!(out, format!("Stopping worker process {}\n", worker.id()));
    assert_eq!(worker.wait().unwrap().signal(), Some(15));
}

#[cfg(unix)]
#[tokio::test]
async fn worker_stop_clears_stale_records() {
    let (_dir, db) = temp_db();

    let mut gone = std::process::Command::new("true").spawn().unwrap();
    gone.wait().unwrap();
    let record = pidfile::record_path(&db, gone.id());
    std::fs::create_dir_all(pidfile::registry_dir(&db)).unwrap();
    std::fs::write(&record, "").unwrap();

    let out = jobq(&db, &["worker", "stop"]).await.unwrap();
    assert_eq!(out, format!("Removed stale record for process {}\n", gone.id()));
    assert!(!record.exists());
}
