//! Job record and its state machine.

use core::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use crate::retry::Resolution;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its first attempt.
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Last attempt failed; waiting for its backoff to elapse.
    Failed,
    /// Retries exhausted; a dead-letter entry exists.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// States a worker may claim from once the job's run time has passed.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }

    /// The transition table. `Processing -> Processing` is a lease reclaim.
    ///
    /// Re-enqueueing is an overwrite of the whole record and does not go
    /// through this table.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
        )
    }

    pub fn ensure_transition(self, next: JobState) -> QueueResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::validation(format!(
                "unknown job state '{other}' \
                 (expected one of pending, processing, completed, failed, dead)"
            ))),
        }
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// Failed attempts so far.
    pub attempts: u32,
    pub max_retries: u32,
    pub base_backoff: u32,
    /// Lower runs first.
    pub priority: i64,
    pub run_at: DateTime<Utc>,
    /// Set after a failed attempt; takes precedence over `run_at`.
    pub next_run_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// When the job next becomes eligible for claiming.
    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.next_run_at.unwrap_or(self.run_at)
    }

    /// A processing job whose holder has not resolved it before the lease ran out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Processing
            && self.lease_expires_at.is_some_and(|expires| expires < now)
    }

    /// Eligibility predicate. Mirrors the claim query of the store.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        (self.state.is_waiting() && self.eligible_at() <= now) || self.lease_expired(now)
    }

    /// Take ownership of the job for `lease`.
    pub fn claim(
        &mut self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        if !self.is_claimable(now) {
            return Err(QueueError::contention(format!(
                "job {} is not claimable (state {})",
                self.id, self.state
            )));
        }
        let expires = now.checked_add_signed(lease).ok_or_else(|| {
            QueueError::validation(format!("lease of {lease} is out of range"))
        })?;
        self.transition(JobState::Processing, now)?;
        self.worker_id = Some(worker_id.to_string());
        self.lease_expires_at = Some(expires);
        Ok(())
    }

    /// Whether this record is still under the claim that produced `claimed`.
    ///
    /// Both the worker id and the lease expiry must match. Worker ids repeat
    /// across processes on one host; a reclaim always moves the expiry
    /// forward, so the expiry fences off the previous holder.
    pub fn is_held_under(&self, claimed: &Job) -> bool {
        self.state == JobState::Processing
            && claimed.worker_id.is_some()
            && claimed.lease_expires_at.is_some()
            && self.worker_id == claimed.worker_id
            && self.lease_expires_at == claimed.lease_expires_at
    }

    /// Apply the outcome of an attempt decided by [`crate::retry::decide`].
    pub fn apply(&mut self, resolution: &Resolution, now: DateTime<Utc>) -> QueueResult<()> {
        self.transition(resolution.target_state(), now)?;
        match resolution {
            Resolution::Completed => {}
            Resolution::Retry {
                attempts,
                next_run_at,
                last_error,
                ..
            } => {
                self.attempts = *attempts;
                self.next_run_at = Some(*next_run_at);
                self.last_error = Some(last_error.clone());
            }
            Resolution::DeadLetter {
                attempts,
                last_error,
            } => {
                self.attempts = *attempts;
                self.last_error = Some(last_error.clone());
            }
        }
        self.lease_expires_at = None;
        Ok(())
    }

    fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> QueueResult<()> {
        self.state.ensure_transition(next)?;
        self.state = next;
        self.updated_at = now;
        Ok(())
    }
}

/// Enqueue request.
///
/// Zero `max_retries` / `base_backoff` mean "use the configured default".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub base_backoff: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_backoff(mut self, base_backoff: u32) -> Self {
        self.base_backoff = base_backoff;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Validate and materialize a fresh pending job.
    pub fn into_job(self, config: &QueueConfig, now: DateTime<Utc>) -> QueueResult<Job> {
        let id = JobId::new(self.id)?;
        if self.command.trim().is_empty() {
            return Err(QueueError::validation("command required"));
        }

        let max_retries = if self.max_retries == 0 {
            config.max_retries
        } else {
            self.max_retries
        };
        let base_backoff = if self.base_backoff == 0 {
            config.backoff_base
        } else {
            self.base_backoff
        };

        Ok(Job {
            id,
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            base_backoff: base_backoff.max(1),
            priority: self.priority,
            run_at: self.run_at.unwrap_or(now),
            next_run_at: None,
            lease_expires_at: None,
            worker_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }
}
