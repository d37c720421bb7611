//! Queue error model.

use thiserror::Error;

use crate::job::JobState;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// `NoJobAvailable` and `Contention` are expected outcomes of a claim, not
/// failures; the worker loop treats them (and `Store`) as transient. A failed
/// job execution is never an error here, it is an input to the retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Input failed validation (empty id, empty command, bad config value).
    #[error("validation failed: {0}")]
    Validation(String),

    /// No job is currently eligible for claiming.
    #[error("no job available")]
    NoJobAvailable,

    /// Another worker won the race for the selected job, or the store was busy.
    #[error("contention: {0}")]
    Contention(String),

    /// A requested job or dead-letter entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A state change outside the job state machine was attempted.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// The worker resolving a job no longer holds its lease.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Transaction or connectivity failure in the persistent store.
    #[error("store error: {0}")]
    Store(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn contention(msg: impl Into<String>) -> Self {
        Self::Contention(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn lease_lost(msg: impl Into<String>) -> Self {
        Self::LeaseLost(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Whether a worker loop should back off and try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::NoJobAvailable | QueueError::Contention(_) | QueueError::Store(_)
        )
    }
}
