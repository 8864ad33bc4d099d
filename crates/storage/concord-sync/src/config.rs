//! Configuration for state synchronization

use crate::error::{Result, SyncError};
use crate::types::ResolutionStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryConfig,
    /// Changes kept in memory per swarm before the oldest are compacted
    pub change_log_retention: usize,
    /// Strategy for keys without a declared merge type
    pub default_strategy: ResolutionStrategy,
    /// Age after which `prune_events` deletes stored events
    pub event_retention_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            change_log_retention: 10_000,
            default_strategy: ResolutionStrategy::LastWriteWins,
            event_retention_days: 30,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_change_log_retention(mut self, changes: usize) -> Self {
        self.change_log_retention = changes;
        self
    }

    pub fn with_default_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn with_event_retention_days(mut self, days: u32) -> Self {
        self.event_retention_days = days;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        if self.change_log_retention == 0 {
            return Err(invalid("change_log_retention must be at least 1"));
        }
        Ok(())
    }
}

/// Bounded exponential backoff for unreachable peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            multiplier: 2.0,
            max_delay_ms: 2_000,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts; for tests and in-process links
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
            jitter: 0.0,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if !(self.multiplier >= 1.0) {
            return Err(invalid("retry.multiplier must be >= 1.0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(invalid("retry.jitter must be in [0, 1]"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SyncError {
    SyncError::InvalidConfiguration(msg.to_string())
}
