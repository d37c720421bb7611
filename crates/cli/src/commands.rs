//! Subcommand implementations.
//!
//! Each command writes its human-readable result to `out`; logs go through
//! `tracing` to stderr.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use jobq_core::{DeadLetterId, JobState, NewJob, QueueError, QueueResult};
use jobq_infra::{load_config, update_config, JobStore, Scheduler, ShellExecutor, WorkerPool};

use crate::cli::EnqueueArgs;
use crate::pidfile::{self, PidFile};

/// Enqueue input, either parsed from a JSON argument or assembled from flags.
#[derive(Debug, Default, Deserialize)]
struct JobInput {
    #[serde(default)]
    id: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    base_backoff: Option<u32>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    run_at: Option<String>,
}

impl JobInput {
    fn into_new_job(self) -> QueueResult<NewJob> {
        let run_at = match self.run_at.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_run_at(raw)?),
        };

        Ok(NewJob {
            id: self.id,
            command: self.command,
            max_retries: self.max_retries.unwrap_or(0),
            base_backoff: self.base_backoff.unwrap_or(0),
            priority: self.priority.unwrap_or(0),
            run_at,
        })
    }
}

fn parse_run_at(raw: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QueueError::validation(format!("invalid run_at '{raw}': {e}")))
}

/// Build an enqueue request from the command line.
///
/// A first positional argument starting with `{` is a JSON job object and
/// flags are ignored. Otherwise flags are used, and leftover words become the
/// command when `--cmd` is missing.
pub fn parse_enqueue(args: &EnqueueArgs) -> QueueResult<NewJob> {
    let input = match args.job.first() {
        Some(first) if first.trim_start().starts_with('{') => serde_json::from_str(first)
            .map_err(|e| QueueError::validation(format!("invalid job JSON: {e}")))?,
        _ => JobInput {
            id: args.id.clone().unwrap_or_default(),
            command: args
                .command
                .clone()
                .filter(|command| !command.trim().is_empty())
                .unwrap_or_else(|| args.job.join(" ")),
            max_retries: args.max_retries,
            base_backoff: None,
            priority: args.priority,
            run_at: args.run_at.clone(),
        },
    };
    input.into_new_job()
}

pub async fn enqueue(
    scheduler: &Scheduler,
    args: &EnqueueArgs,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let job = scheduler.enqueue(parse_enqueue(args)?).await?;
    writeln!(out, "Job {} enqueued", job.id)?;
    Ok(())
}

pub async fn list(
    scheduler: &Scheduler,
    state: JobState,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let jobs = scheduler.list(state).await?;

    writeln!(out, "Jobs in state: {state}")?;
    writeln!(out, "{}", "-".repeat(58))?;
    for job in jobs {
        writeln!(
            out,
            "{:<10} {:<30} ({}) attempts={}/{}",
            job.id, job.command, job.state, job.attempts, job.max_retries
        )?;
    }
    Ok(())
}

pub async fn status(scheduler: &Scheduler, out: &mut impl Write) -> anyhow::Result<()> {
    let status = scheduler.status().await?;

    writeln!(out, "Job states:")?;
    for (state, count) in &status.counts {
        writeln!(out, "  {:<10} : {}", state.as_str(), count)?;
    }

    writeln!(out, "Active workers:")?;
    if status.workers.is_empty() {
        writeln!(out, "  (none)")?;
    }
    for (worker, count) in &status.workers {
        writeln!(out, "  {worker:<10} : {count}")?;
    }
    Ok(())
}

pub async fn dlq_list(scheduler: &Scheduler, out: &mut impl Write) -> anyhow::Result<()> {
    writeln!(out, "Dead letter queue:")?;
    for entry in scheduler.dead_letters().await? {
        writeln!(
            out,
            "{:<10} from {:<10} [{} attempts] - {}",
            entry.id,
            entry.original_id,
            entry.attempts,
            entry.last_error.as_deref().unwrap_or("")
        )?;
    }
    Ok(())
}

pub async fn dlq_retry(
    scheduler: &Scheduler,
    id: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let id = DeadLetterId::new(id)?;
    let job = scheduler.retry_dead_letter(&id).await?;
    writeln!(out, "Retried dead-letter entry {id} as job {}", job.id)?;
    Ok(())
}

pub async fn config_get(store: &dyn JobStore, out: &mut impl Write) -> anyhow::Result<()> {
    for (key, value) in store.config_entries().await? {
        writeln!(out, "{key} = {value}")?;
    }
    Ok(())
}

pub async fn config_set(
    store: &dyn JobStore,
    key: &str,
    value: &str,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    update_config(store, key, value).await?;
    writeln!(out, "Set {key} = {}", value.trim())?;
    Ok(())
}

/// Run `count` shell workers until SIGINT or SIGTERM.
///
/// The process is listed in the worker registry beside `db` while it runs.
pub async fn worker_start(
    store: Arc<dyn JobStore>,
    db: &Path,
    count: u16,
) -> anyhow::Result<()> {
    let _record = PidFile::create(db)?;
    let config = load_config(store.as_ref()).await;
    let scheduler = Scheduler::new(store, config);
    let pool = WorkerPool::new(scheduler, Arc::new(ShellExecutor), usize::from(count));

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!(error = %e, "failed to listen for shutdown signals");
        }
        info!("shutdown requested; waiting for in-flight jobs");
        signal_token.cancel();
    });

    pool.run(token).await;
    Ok(())
}

/// Signal every registered worker process for `db` to shut down gracefully.
///
/// Records of processes that no longer exist are removed.
pub fn worker_stop(db: &Path, out: &mut impl Write) -> anyhow::Result<()> {
    let workers = pidfile::recorded(db)?;
    if workers.is_empty() {
        writeln!(out, "No running workers")?;
        return Ok(());
    }

    for (pid, record) in workers {
        if pidfile::terminate(pid)? {
            info!(pid, "sent SIGTERM to worker process");
            writeln!(out, "Stopping worker process {pid}")?;
        } else {
            std::fs::remove_file(&record)
                .with_context(|| format!("failed to remove {}", record.display()))?;
            writeln!(out, "Removed stale record for process {pid}")?;
        }
    }
    Ok(())
}

async fn wait_for_shutdown() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        info!("Ctrl+C received");
        Ok(())
    }
}
