use crate::error::{ConfirmError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Tunables for confirmation sessions.
///
/// Every field has a default, so a config file only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfirmConfig {
    /// Wall-clock bound on a single confirmation, from the moment it starts.
    pub deadline_ms: u64,
    /// Cadence of the gateway status poll.
    pub poll_interval_ms: u64,
    /// How many ticks the poller re-reads the record waiting for a correlation id.
    pub correlation_lookup_attempts: u32,
    /// Per-request bound on a status query; a slow gateway counts as still pending.
    pub gateway_request_timeout_ms: u64,
    /// Retries of a transiently failing completion action after the first attempt.
    pub completion_retries: u32,
    pub completion_retry_spacing_ms: u64,
    /// Buffer of the in-process change feed.
    pub feed_capacity: usize,
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 90_000,
            poll_interval_ms: 2_000,
            correlation_lookup_attempts: 5,
            gateway_request_timeout_ms: 10_000,
            completion_retries: 6,
            completion_retry_spacing_ms: 2_000,
            feed_capacity: 256,
        }
    }
}

impl ConfirmConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfirmError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.deadline_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ConfirmError::ConfigError(
                "deadline and poll interval must be non-zero".to_string(),
            ));
        }
        if self.poll_interval_ms >= self.deadline_ms {
            return Err(ConfirmError::ConfigError(format!(
                "poll interval ({}ms) must be shorter than the deadline ({}ms)",
                self.poll_interval_ms, self.deadline_ms
            )));
        }
        if self.feed_capacity == 0 {
            return Err(ConfirmError::ConfigError(
                "feed capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn gateway_request_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_request_timeout_ms)
    }

    pub fn completion_retry_spacing(&self) -> Duration {
        Duration::from_millis(self.completion_retry_spacing_ms)
    }
}
