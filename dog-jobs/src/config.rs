//! # Queue configuration
//!
//! Defaults suit a single-node deployment. Any field can be overridden
//! through environment variables using the DogRS `PREFIX__KEY` convention:
//!
//! ```bash
//! export DOG_JOBS__LEASE_DURATION_MS=60000
//! export DOG_JOBS__WORKERS=8
//! ```
//!
//! Keys are lower-cased and `__` becomes `.`, so the variables above map to
//! `lease_duration_ms` and `workers`.

use std::collections::HashMap;
use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Environment prefix read by [`QueueConfig::from_env`]
pub const ENV_PREFIX: &str = "DOG_JOBS__";

/// Longest lease a claim accepts (one year)
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for the queue and its workers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a claimed job stays leased to its worker
    pub lease_duration: Duration,
    /// Pause between empty claims
    pub idle_backoff: Duration,
    /// Random extra pause added to the idle backoff (0 disables)
    pub idle_jitter: Duration,
    /// Upper bound on a single execution; defaults to the lease duration
    pub execution_timeout: Option<Duration>,
    /// Number of candidate rows fetched per scan page while claiming
    pub claim_scan_batch: usize,
    /// Retry budget applied when a submission does not name one
    pub default_max_retries: u32,
    /// Number of workers started by a worker pool
    pub workers: usize,
    /// Worker identity prefix; workers are named `{prefix}-{n}`
    pub worker_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            idle_backoff: Duration::from_secs(1),
            idle_jitter: Duration::from_millis(250),
            execution_timeout: None,
            claim_scan_batch: 32,
            default_max_retries: 3,
            workers: 4,
            worker_prefix: "worker".to_string(),
        }
    }
}

impl QueueConfig {
    /// Load defaults overridden by `DOG_JOBS__*` environment variables
    pub fn from_env() -> QueueResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Load defaults overridden by `(name, value)` pairs carrying [`ENV_PREFIX`]
    pub fn from_vars<I, K, V>(vars: I) -> QueueResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.as_ref()
                    .strip_prefix(ENV_PREFIX)
                    .map(|stripped| (stripped.to_lowercase().replace("__", "."), value.into()))
            })
            .collect();

        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&values, "lease_duration_ms")? {
            config.lease_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&values, "idle_backoff_ms")? {
            config.idle_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&values, "idle_jitter_ms")? {
            config.idle_jitter = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&values, "execution_timeout_ms")? {
            config.execution_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(batch) = parse::<usize>(&values, "claim_scan_batch")? {
            config.claim_scan_batch = batch;
        }
        if let Some(retries) = parse::<u32>(&values, "default_max_retries")? {
            config.default_max_retries = retries;
        }
        if let Some(workers) = parse::<usize>(&values, "workers")? {
            config.workers = workers;
        }
        if let Some(prefix) = values.get("worker_prefix") {
            config.worker_prefix = prefix.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the lease protocol cannot work with
    pub fn validate(&self) -> QueueResult<()> {
        if self.lease_duration.is_zero() {
            return Err(QueueError::Config("lease_duration must be positive".into()));
        }
        if self.lease_duration > MAX_LEASE_DURATION {
            return Err(QueueError::Config(format!(
                "lease_duration ({:?}) exceeds the maximum of {:?}",
                self.lease_duration, MAX_LEASE_DURATION
            )));
        }
        if self.claim_scan_batch == 0 {
            return Err(QueueError::Config("claim_scan_batch must be at least 1".into()));
        }
        if let Some(timeout) = self.execution_timeout {
            if timeout > self.lease_duration {
                return Err(QueueError::Config(format!(
                    "execution_timeout ({:?}) exceeds lease_duration ({:?})",
                    timeout, self.lease_duration
                )));
            }
        }
        Ok(())
    }

    /// Execution bound actually applied by workers
    pub fn effective_execution_timeout(&self) -> Duration {
        self.execution_timeout.unwrap_or(self.lease_duration)
    }
}

fn parse<T>(values: &HashMap<String, String>, key: &str) -> QueueResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    values
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| QueueError::Config(format!("{}{}: {}", ENV_PREFIX, key.to_uppercase(), e)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = QueueConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_execution_timeout(), config.lease_duration);
    }

    #[test]
    fn test_env_overrides() {
        let config = QueueConfig::from_vars(vec![
            ("DOG_JOBS__LEASE_DURATION_MS", "60000"),
            ("DOG_JOBS__WORKERS", "8"),
            ("DOG_JOBS__WORKER_PREFIX", "billing"),
            ("UNRELATED", "ignored"),
        ])
        .unwrap();

        assert_eq!(config.lease_duration, Duration::from_secs(60));
        assert_eq!(config.workers, 8);
        assert_eq!(config.worker_prefix, "billing");
        assert_eq!(config.default_max_retries, 3);
    }

    #[test]
    fn test_unparsable_value_is_reported() {
        let result = QueueConfig::from_vars(vec![("DOG_JOBS__WORKERS", "many")]);
        match result {
            Err(QueueError::Config(msg)) => assert!(msg.contains("DOG_JOBS__WORKERS")),
            other => panic!("Expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_lease_is_rejected() {
        let result = QueueConfig::from_vars(vec![(
            "DOG_JOBS__LEASE_DURATION_MS",
            "10000000000000000",
        )]);
        match result {
            Err(QueueError::Config(msg)) => assert!(msg.contains("lease_duration")),
            other => panic!("Expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_longer_than_lease_is_rejected() {
        let result = QueueConfig::from_vars(vec![
            ("DOG_JOBS__LEASE_DURATION_MS", "1000"),
            ("DOG_JOBS__EXECUTION_TIMEOUT_MS", "5000"),
        ]);
        assert!(matches!(result, Err(QueueError::Config(_))));
    }
}
