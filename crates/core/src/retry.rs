//! Retry / dead-letter policy.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::backoff_delay;
use crate::job::{Job, JobState};
use crate::outcome::ExecutionOutcome;

/// What should happen to a job after one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    /// Schedule another attempt after `delay`.
    Retry {
        attempts: u32,
        delay: Duration,
        next_run_at: DateTime<Utc>,
        last_error: String,
    },
    /// Give up and write a dead-letter entry.
    DeadLetter { attempts: u32, last_error: String },
}

impl Resolution {
    pub fn target_state(&self) -> JobState {
        match self {
            Resolution::Completed => JobState::Completed,
            Resolution::Retry { .. } => JobState::Failed,
            Resolution::DeadLetter { .. } => JobState::Dead,
        }
    }
}

/// Decide the fate of `job` given the outcome of its latest attempt.
///
/// A failure increments `attempts`; while the new count is at most
/// `max_retries` the job is rescheduled `min(base_backoff ^ attempts, 1800)`
/// seconds out, otherwise it is dead-lettered.
pub fn decide(job: &Job, outcome: &ExecutionOutcome, now: DateTime<Utc>) -> Resolution {
    if outcome.is_success() {
        return Resolution::Completed;
    }

    let attempts = job.attempts.saturating_add(1);
    let last_error = outcome.diagnostic();

    if attempts > job.max_retries {
        return Resolution::DeadLetter {
            attempts,
            last_error,
        };
    }

    let delay = backoff_delay(job.base_backoff, attempts);
    // The delay is capped at 30 minutes, so the conversion cannot overflow.
    let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

    Resolution::Retry {
        attempts,
        delay,
        next_run_at,
        last_error,
    }
}
