//! `jobq` command-line front end.

pub mod cli;
pub mod commands;
pub mod pidfile;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use jobq_infra::{db, load_config, Scheduler, SqliteJobStore};

use crate::cli::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};

/// Open (and migrate) the queue database at `path`.
pub async fn open_store(path: &Path) -> anyhow::Result<Arc<SqliteJobStore>> {
    let pool = db::connect(path)
        .await
        .with_context(|| format!("failed to open queue database at {}", path.display()))?;
    Ok(Arc::new(SqliteJobStore::new(pool)))
}

async fn scheduler(store: Arc<SqliteJobStore>) -> Scheduler {
    let config = load_config(store.as_ref()).await;
    Scheduler::new(store, config)
}

/// Execute one parsed command line, writing results to `out`.
pub async fn run(cli: Cli, out: &mut impl Write) -> anyhow::Result<()> {
    let store = open_store(&cli.db).await?;

    match cli.command {
        Command::Enqueue(args) => commands::enqueue(&scheduler(store).await, &args, out).await,
        Command::List { state } => commands::list(&scheduler(store).await, state, out).await,
        Command::Status => commands::status(&scheduler(store).await, out).await,
        Command::Worker { command } => match command {
            WorkerCommand::Start { count } => commands::worker_start(store, &cli.db, count).await,
            WorkerCommand::Stop => commands::worker_stop(&cli.db, out),
        },
        Command::Dlq { command } => {
            let scheduler = scheduler(store).await;
            match command {
                DlqCommand::List => commands::dlq_list(&scheduler, out).await,
                DlqCommand::Retry { id } => commands::dlq_retry(&scheduler, &id, out).await,
            }
        }
        Command::Config { command } => match command {
            ConfigCommand::Get => commands::config_get(store.as_ref(), out).await,
            ConfigCommand::Set { key, value } => {
                commands::config_set(store.as_ref(), &key, &value, out).await
            }
        },
    }
}
