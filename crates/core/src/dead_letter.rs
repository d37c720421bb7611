//! Dead-letter entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DeadLetterId, JobId};
use crate::job::NewJob;

/// Terminal record of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub original_id: JobId,
    pub command: String,
    /// Final attempt count.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        original_id: JobId,
        command: impl Into<String>,
        attempts: u32,
        last_error: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: original_id.dead_letter_id(),
            original_id,
            command: command.into(),
            attempts,
            last_error,
            created_at,
        }
    }

    /// A brand-new job re-running this entry's command with default policy.
    ///
    /// The id is derived from the original, so resubmitting twice targets the
    /// same job.
    pub fn resubmission(&self) -> NewJob {
        NewJob::new(self.original_id.retry_id().into_inner(), self.command.clone())
    }
}
