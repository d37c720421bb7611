//! Infrastructure layer: SQLite storage, scheduling, command execution and
//! the worker pool.

pub mod config;
pub mod db;
pub mod executor;
pub mod jobs;
pub mod workers;

pub use config::{load_config, update_config};
pub use executor::{Executor, ShellExecutor};
pub use jobs::{Clock, JobStore, ManualClock, QueueStatus, Scheduler, SqliteJobStore, SystemClock};
pub use workers::{PoolStats, WorkerPool, WorkerPoolHandle};
