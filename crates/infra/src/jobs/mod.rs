//! Persistent job queue: storage, claiming and resolution.
//!
//! ## Components
//!
//! - `JobStore`: transactional persistence for jobs, dead letters and config
//! - `SqliteJobStore`: the SQLite implementation and its claim protocol
//! - `Scheduler`: enqueue / claim / resolve / dead-letter retry over a store
//! - `Clock`: time source, swappable in tests

pub mod clock;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{QueueStatus, Scheduler};
pub use sqlite::{map_sqlx_error, SqliteJobStore};
pub use store::JobStore;
