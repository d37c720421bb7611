//! Strongly-typed identifiers for jobs and dead-letter entries.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Caller-assigned identifier of a job (primary key of the jobs table).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identifier of a dead-letter entry, derived from the job it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create an identifier, rejecting empty or whitespace-only input.
            pub fn new(value: impl Into<String>) -> Result<Self, QueueError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(QueueError::validation(concat!($name, " required")));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = QueueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_newtype!(JobId, "job id");
impl_string_newtype!(DeadLetterId, "dead-letter id");

const DEAD_LETTER_SUFFIX: &str = "-dlq";
const RETRY_SUFFIX: &str = "-retry";

impl JobId {
    /// Id of the dead-letter entry written when this job exhausts its retries.
    ///
    /// Stable per job, so dead-lettering the same job twice overwrites.
    pub fn dead_letter_id(&self) -> DeadLetterId {
        DeadLetterId(format!("{}{}", self.0, DEAD_LETTER_SUFFIX))
    }

    /// Id of the fresh job created when a dead-lettered job is resubmitted.
    pub fn retry_id(&self) -> JobId {
        JobId(format!("{}{}", self.0, RETRY_SUFFIX))
    }
}
