//! Queue tunables.
//!
//! Stored as string key/value pairs in the config table and read once when a
//! worker pool starts. Anything missing or malformed falls back to the
//! built-in default.

use core::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{QueueError, QueueResult};

/// Upper bound for `lease_seconds` and `job_timeout_seconds` (one week).
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Upper bound for `poll_interval_ms` (one hour).
pub const MAX_POLL_INTERVAL_MS: u64 = 60 * 60 * 1000;

/// Slack a lease keeps beyond the job timeout, covering the kill of a
/// timed-out command and recording its outcome.
pub const LEASE_MARGIN_SECS: u64 = 10;

/// Recognized configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    LeaseSeconds,
    JobTimeoutSeconds,
    PollIntervalMs,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 5] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::LeaseSeconds,
        ConfigKey::JobTimeoutSeconds,
        ConfigKey::PollIntervalMs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::LeaseSeconds => "lease_seconds",
            ConfigKey::JobTimeoutSeconds => "job_timeout_seconds",
            ConfigKey::PollIntervalMs => "poll_interval_ms",
        }
    }

    /// Only `max_retries` may be zero.
    fn min_value(&self) -> u64 {
        match self {
            ConfigKey::MaxRetries => 0,
            _ => 1,
        }
    }

    fn max_value(&self) -> u64 {
        match self {
            ConfigKey::MaxRetries | ConfigKey::BackoffBase => u64::from(u32::MAX),
            ConfigKey::LeaseSeconds | ConfigKey::JobTimeoutSeconds => MAX_DURATION_SECS,
            ConfigKey::PollIntervalMs => MAX_POLL_INTERVAL_MS,
        }
    }

    /// Parse a raw value for this key.
    pub fn parse_value(&self, raw: &str) -> QueueResult<u64> {
        let value: u64 = raw.trim().parse().map_err(|_| {
            QueueError::validation(format!(
                "{}: expected a non-negative integer, got '{raw}'",
                self.as_str()
            ))
        })?;
        if value < self.min_value() || value > self.max_value() {
            return Err(QueueError::validation(format!(
                "{}: must be between {} and {}",
                self.as_str(),
                self.min_value(),
                self.max_value()
            )));
        }
        Ok(value)
    }
}

impl core::fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConfigKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = ConfigKey::ALL.iter().map(|key| key.as_str()).collect();
                QueueError::validation(format!(
                    "unknown config key '{s}' (expected one of {})",
                    known.join(", ")
                ))
            })
    }
}

/// Process-wide queue tunables, passed explicitly to whoever needs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Default retry budget for jobs enqueued without one.
    pub max_retries: u32,
    /// Default exponential backoff base, in seconds.
    pub backoff_base: u32,
    pub lease_seconds: u64,
    pub job_timeout_seconds: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            lease_seconds: 60,
            job_timeout_seconds: 30,
            poll_interval_ms: 500,
        }
    }
}

impl QueueConfig {
    /// Build a config from stored key/value pairs.
    ///
    /// Unknown keys are ignored; unparseable or out-of-range values keep the
    /// default and are logged.
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in entries {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Ok(parsed_key) = key.parse::<ConfigKey>() else {
                continue;
            };
            if let Err(err) = config.set(parsed_key, value) {
                warn!(key, value, error = %err, "ignoring invalid config value; using default");
            }
        }
        config
    }

    /// Set one field from its raw string value.
    pub fn set(&mut self, key: ConfigKey, raw: &str) -> QueueResult<()> {
        let value = key.parse_value(raw)?;
        match key {
            // parse_value bounds these two to u32.
            ConfigKey::MaxRetries => self.max_retries = value as u32,
            ConfigKey::BackoffBase => self.backoff_base = value as u32,
            ConfigKey::LeaseSeconds => self.lease_seconds = value,
            ConfigKey::JobTimeoutSeconds => self.job_timeout_seconds = value,
            ConfigKey::PollIntervalMs => self.poll_interval_ms = value,
        }
        Ok(())
    }

    pub fn get(&self, key: ConfigKey) -> u64 {
        match key {
            ConfigKey::MaxRetries => u64::from(self.max_retries),
            ConfigKey::BackoffBase => u64::from(self.backoff_base),
            ConfigKey::LeaseSeconds => self.lease_seconds,
            ConfigKey::JobTimeoutSeconds => self.job_timeout_seconds,
            ConfigKey::PollIntervalMs => self.poll_interval_ms,
        }
    }

    /// All keys with their values, in seeding order.
    pub fn entries(&self) -> Vec<(ConfigKey, String)> {
        ConfigKey::ALL
            .into_iter()
            .map(|key| (key, self.get(key).to_string()))
            .collect()
    }

    /// Lease length workers actually claim with, in seconds.
    ///
    /// Never shorter than the job timeout plus [`LEASE_MARGIN_SECS`]: a lease
    /// that ran out mid-execution would hand a live job to a second worker.
    pub fn effective_lease_seconds(&self) -> u64 {
        let floor = self.job_timeout_seconds.min(MAX_DURATION_SECS) + LEASE_MARGIN_SECS;
        self.lease_seconds.min(MAX_DURATION_SECS).max(floor)
    }

    /// Whether the configured lease had to be raised to cover the job timeout.
    pub fn lease_is_raised(&self) -> bool {
        self.effective_lease_seconds() != self.lease_seconds
    }

    pub fn lease(&self) -> chrono::Duration {
        // Bounded by two MAX_DURATION_SECS terms, far inside chrono's range.
        chrono::Duration::seconds(self.effective_lease_seconds() as i64)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds.min(MAX_DURATION_SECS))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.min(MAX_POLL_INTERVAL_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, 2);
        assert_eq!(config.lease_seconds, 60);
        assert_eq!(config.job_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn from_entries_overrides_known_keys() {
        let config = QueueConfig::from_entries([
            ("max_retries", "5"),
            ("backoff_base", "3"),
            ("lease_seconds", "120"),
            ("job_timeout_seconds", "10"),
            ("poll_interval_ms", "50"),
            ("theme", "dark"),
        ]);
        assert_eq!(
            config,
            QueueConfig {
                max_retries: 5,
                backoff_base: 3,
                lease_seconds: 120,
                job_timeout_seconds: 10,
                poll_interval_ms: 50,
            }
        );
    }

    #[test]
    fn from_entries_falls_back_on_garbage() {
        let config = QueueConfig::from_entries([
            ("max_retries", "lots"),
            ("backoff_base", "0"),
            ("lease_seconds", "-5"),
            ("poll_interval_ms", ""),
        ]);
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn max_retries_may_be_zero() {
        let config = QueueConfig::from_entries([("max_retries", "0")]);
        assert_eq!(config.max_retries, 0);
    }

    #[test]
    fn unknown_key_is_a_validation_error() {
        assert!(matches!(
            "timeout".parse::<ConfigKey>(),
            Err(QueueError::Validation(_))
        ));
        for key in ConfigKey::ALL {
            assert_eq!(key.as_str().parse::<ConfigKey>().unwrap(), key);
        }
    }

    #[test]
    fn entries_round_trip() {
        let config = QueueConfig {
            max_retries: 9,
            ..QueueConfig::default()
        };
        let entries = config.entries();
        let raw = entries.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        assert_eq!(QueueConfig::from_entries(raw), config);
    }

    #[test]
    fn durations_are_bounded() {
        for key in [ConfigKey::LeaseSeconds, ConfigKey::JobTimeoutSeconds] {
            assert!(matches!(
                key.parse_value("10000000000000"),
                Err(QueueError::Validation(_))
            ));
            assert_eq!(
                key.parse_value(&MAX_DURATION_SECS.to_string()).unwrap(),
                MAX_DURATION_SECS
            );
        }
        assert!(ConfigKey::PollIntervalMs.parse_value("3600001").is_err());

        let config = QueueConfig::from_entries([("lease_seconds", "10000000000000")]);
        assert_eq!(config.lease_seconds, 60);
    }

    #[test]
    fn lease_covers_the_job_timeout() {
        let short = QueueConfig {
            lease_seconds: 1,
            job_timeout_seconds: 30,
            ..QueueConfig::default()
        };
        assert_eq!(short.effective_lease_seconds(), 30 + LEASE_MARGIN_SECS);
        assert_eq!(short.lease(), chrono::Duration::seconds(40));
        assert!(short.lease_is_raised());

        let roomy = QueueConfig::default();
        assert_eq!(roomy.effective_lease_seconds(), 60);
        assert!(!roomy.lease_is_raised());
    }

    #[test]
    fn oversized_fields_do_not_overflow_durations() {
        let config = QueueConfig {
            lease_seconds: u64::MAX,
            job_timeout_seconds: u64::MAX,
            poll_interval_ms: u64::MAX,
            ..QueueConfig::default()
        };
        assert_eq!(
            config.effective_lease_seconds(),
            MAX_DURATION_SECS + LEASE_MARGIN_SECS
        );
        assert_eq!(config.job_timeout(), Duration::from_secs(MAX_DURATION_SECS));
        assert_eq!(
            config.poll_interval(),
            Duration::from_millis(MAX_POLL_INTERVAL_MS)
        );
    }

    proptest! {
        #[test]
        fn in_range_values_are_accepted(value in 1u64..=MAX_DURATION_SECS) {
            for key in ConfigKey::ALL {
                prop_assert_eq!(key.parse_value(&value.to_string()).unwrap(), value);
            }
        }

        #[test]
        fn values_above_the_bound_are_rejected(excess in 1u64..=1_000_000) {
            for key in ConfigKey::ALL {
                let raw = (key.max_value() + excess).to_string();
                prop_assert!(key.parse_value(&raw).is_err());
            }
        }

        #[test]
        fn non_numeric_values_are_rejected(raw in "[a-z ]{1,12}") {
            for key in ConfigKey::ALL {
                prop_assert!(key.parse_value(&raw).is_err());
            }
        }
    }
}
