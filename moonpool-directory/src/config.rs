//! Directory configuration.
//!
//! Separates the tunables of the distributed directory (ring shape, retry
//! policy, shutdown grace) from the collaborators it is wired to.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of virtual partitions per silo.
pub const DEFAULT_PARTITIONS_PER_SILO: usize = 30;

/// Configuration for a [`DistributedGrainDirectory`](crate::DistributedGrainDirectory).
///
/// Every silo in a cluster must use the same `partitions_per_silo`,
/// otherwise silos disagree on ring ownership.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use moonpool_directory::DirectoryConfig;
///
/// let config = DirectoryConfig::builder()
///     .partitions_per_silo(8)
///     .max_attempts(3)
///     .initial_backoff(Duration::from_millis(1))
///     .build()
///     .expect("valid config");
/// assert_eq!(config.partitions_per_silo(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    partitions_per_silo: usize,
    max_attempts: u32,
    initial_backoff: Duration,
    backoff_multiplier: f64,
    max_backoff: Duration,
    shutdown_grace: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            partitions_per_silo: DEFAULT_PARTITIONS_PER_SILO,
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            backoff_multiplier: 1.5,
            max_backoff: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl DirectoryConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> DirectoryConfigBuilder {
        DirectoryConfigBuilder::default()
    }

    /// Virtual partitions per active silo.
    pub fn partitions_per_silo(&self) -> usize {
        self.partitions_per_silo
    }

    /// Rejected attempts tolerated per operation before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the first retry.
    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    /// Backoff growth factor.
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Upper bound on a single backoff delay.
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Time allowed for range hand-off during shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// The delay following `delay` in the backoff sequence.
    pub fn next_backoff(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.backoff_multiplier).min(self.max_backoff)
    }
}

/// Builder for [`DirectoryConfig`].
#[derive(Debug, Clone, Default)]
pub struct DirectoryConfigBuilder {
    config: DirectoryConfig,
}

impl DirectoryConfigBuilder {
    /// Set the number of virtual partitions per silo.
    pub fn partitions_per_silo(mut self, partitions: usize) -> Self {
        self.config.partitions_per_silo = partitions;
        self
    }

    /// Set the retry budget for rejected calls.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the first retry delay.
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.config.initial_backoff = delay;
        self
    }

    /// Set the backoff growth factor.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    /// Set the backoff cap.
    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.config.max_backoff = delay;
        self
    }

    /// Set the shutdown hand-off grace period.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<DirectoryConfig, ConfigError> {
        let config = self.config;
        if config.partitions_per_silo == 0 {
            return Err(ConfigError::NoPartitions);
        }
        if config.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if !(config.backoff_multiplier >= 1.0) {
            return Err(ConfigError::ShrinkingBackoff(config.backoff_multiplier));
        }
        Ok(config)
    }
}
