//! `jobq-core`: job queue domain model.
//!
//! Pure types and policy: job records and their state machine, the retry and
//! backoff rules, dead-letter entries and queue configuration. No I/O.

pub mod backoff;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod id;
pub mod job;
pub mod outcome;
pub mod retry;

pub use backoff::{backoff_delay, backoff_secs, MAX_BACKOFF_SECS};
pub use config::{ConfigKey, QueueConfig};
pub use dead_letter::DeadLetterEntry;
pub use error::{QueueError, QueueResult};
pub use id::{DeadLetterId, JobId};
pub use job::{Job, JobState, NewJob};
pub use outcome::{ExecutionOutcome, NO_EXIT_CODE};
pub use retry::{decide, Resolution};
