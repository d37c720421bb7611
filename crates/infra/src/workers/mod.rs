//! Background workers.

pub mod pool;

pub use pool::{host_name, PoolStats, WorkerPool, WorkerPoolHandle, CONTENTION_BACKOFF};
