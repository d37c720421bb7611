//! Exponential retry delay.

use std::time::Duration;

/// Upper bound on any retry delay (30 minutes).
pub const MAX_BACKOFF_SECS: u64 = 1800;

/// Delay before the retry following failed attempt number `attempts`.
///
/// `min(base ^ attempts, 1800)` seconds. `attempts` counts from 1 for the first
/// retry. A base of zero is treated as one.
pub fn backoff_delay(base: u32, attempts: u32) -> Duration {
    Duration::from_secs(backoff_secs(base, attempts))
}

/// Same as [`backoff_delay`], in whole seconds.
pub fn backoff_secs(base: u32, attempts: u32) -> u64 {
    let base = u64::from(base.max(1));
    base.checked_pow(attempts)
        .map_or(MAX_BACKOFF_SECS, |secs| secs.min(MAX_BACKOFF_SECS))
}
