//! Command-line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use jobq_core::JobState;
use jobq_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "jobq")]
#[command(about = "Persistent multi-worker job queue", long_about = None)]
pub struct Cli {
    /// Path to the queue database (created if missing)
    #[arg(long, env = "JOBQ_DB", default_value = "queue.db", global = true)]
    pub db: PathBuf,

    /// Log output format: pretty or json (filter with RUST_LOG)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enqueue a job from a JSON object or flags
    ///
    /// Examples:
    ///   jobq enqueue --id job1 --cmd "echo Hello"
    ///   jobq enqueue '{"id":"job2","command":"sleep 5","priority":1}'
    Enqueue(EnqueueArgs),

    /// List jobs in one state, oldest first
    List {
        /// pending, processing, completed, failed or dead
        #[arg(long, default_value = "pending")]
        state: JobState,
    },

    /// Show job counts by state and active workers
    Status,

    /// Manage workers
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Inspect and retry dead-lettered jobs
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },

    /// Read or change queue configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct EnqueueArgs {
    /// A JSON job object, or words forming the command when --cmd is absent
    #[arg(trailing_var_arg = true)]
    pub job: Vec<String>,

    /// Job id
    #[arg(long)]
    pub id: Option<String>,

    /// Command to run
    #[arg(long = "cmd")]
    pub command: Option<String>,

    /// Retry budget (defaults to the configured max_retries)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Lower runs first
    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i64>,

    /// Earliest run time, RFC3339 (defaults to now)
    #[arg(long)]
    pub run_at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Run workers until SIGINT/SIGTERM
    Start {
        /// Number of concurrent workers
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
        count: u16,
    },
    /// Send SIGTERM to every `worker start` process using this database
    Stop,
}

#[derive(Debug, Subcommand)]
pub enum DlqCommand {
    /// List dead-letter entries
    List,
    /// Resubmit a dead-letter entry as a new job
    Retry {
        /// Dead-letter entry id (e.g. job1-dlq)
        id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show all stored values
    Get,
    /// Set one value; takes effect at the next worker start
    Set { key: String, value: String },
}
