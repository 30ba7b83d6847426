//! Replication worker configuration

use crate::applier::DEFAULT_FETCH_SIZE;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default pause after a batch was applied, in milliseconds
pub const DEFAULT_AVAILABLE_SLEEP_MS: u64 = 1_000;

/// Default pause when no new snapshot was found, in milliseconds
pub const DEFAULT_UNAVAILABLE_SLEEP_MS: u64 = 1_000;

/// Tuning values for one replication worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Pause after a snapshot was found (applied or not)
    #[serde(with = "serde_millis")]
    pub available_sleep: Duration,

    /// Pause when the master had no snapshot beyond the last applied one
    #[serde(with = "serde_millis")]
    pub unavailable_sleep: Duration,

    /// Change rows fetched from the master per round trip
    pub fetch_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            available_sleep: Duration::from_millis(DEFAULT_AVAILABLE_SLEEP_MS),
            unavailable_sleep: Duration::from_millis(DEFAULT_UNAVAILABLE_SLEEP_MS),
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }
}

impl ReplicationConfig {
    /// Set the pause after a snapshot was found
    pub fn with_available_sleep(mut self, sleep: Duration) -> Self {
        self.available_sleep = sleep;
        self
    }

    /// Set the pause when no snapshot was found
    pub fn with_unavailable_sleep(mut self, sleep: Duration) -> Self {
        self.unavailable_sleep = sleep;
        self
    }

    /// Set the master fetch size
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }

    /// Load overrides from the environment on top of the defaults.
    ///
    /// Reads `SNAPLOG_AVAILABLE_SLEEP_MS`, `SNAPLOG_UNAVAILABLE_SLEEP_MS` and
    /// `SNAPLOG_FETCH_SIZE`. Unset variables keep their defaults; unparsable
    /// ones are an error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = env_number("SNAPLOG_AVAILABLE_SLEEP_MS")? {
            config.available_sleep = Duration::from_millis(ms);
        }
        if let Some(ms) = env_number("SNAPLOG_UNAVAILABLE_SLEEP_MS")? {
            config.unavailable_sleep = Duration::from_millis(ms);
        }
        if let Some(n) = env_number("SNAPLOG_FETCH_SIZE")? {
            config.fetch_size = n as usize;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.available_sleep.is_zero() {
            return Err(Error::config("available_sleep must be positive"));
        }
        if self.unavailable_sleep.is_zero() {
            return Err(Error::config("unavailable_sleep must be positive"));
        }
        if self.fetch_size == 0 {
            return Err(Error::config("fetch_size must be at least 1"));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::config(format!("{} = {:?}: {}", key, raw, e))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(Error::config(format!("{}: {}", key, e))),
    }
}
