//! Result of running a job's command.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Output kept in `last_error` diagnostics.
pub const MAX_DIAGNOSTIC_OUTPUT_CHARS: usize = 512;

/// Exit code reported when the process never produced one (spawn failure,
/// timeout, killed by signal).
pub const NO_EXIT_CODE: i32 = -1;

/// What the executor reports back for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Combined stdout and stderr.
    pub output: String,
    pub exit_code: i32,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
            error: None,
        }
    }

    pub fn failure(exit_code: i32, error: Option<String>, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code,
            error,
        }
    }

    pub fn timed_out(timeout: Duration, output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: NO_EXIT_CODE,
            error: Some(format!("timed out after {}s", timeout.as_secs_f64())),
        }
    }

    /// Only a clean zero exit with no error counts as success.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    /// One-line failure description stored as the job's `last_error`.
    pub fn diagnostic(&self) -> String {
        let error = self.error.as_deref().unwrap_or("none");
        format!(
            "exit={} err={} out={}",
            self.exit_code,
            error,
            truncate(self.output.trim_end(), MAX_DIAGNOSTIC_OUTPUT_CHARS)
        )
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...(truncated)", &text[..cut]),
        None => text.to_string(),
    }
}
