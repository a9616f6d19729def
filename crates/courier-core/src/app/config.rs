//! Scheduler configuration.
//!
//! The core only consumes these values; loading them from files or the
//! environment is the embedding application's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },

    #[error("base_delay_ms ({base}) must not exceed max_delay_ms ({max})")]
    BackoffInverted { base: u64, max: u64 },
}

/// Tunables for [`Scheduler`](super::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the worker pool (`W`).
    pub workers: usize,

    /// Max tasks Running at once per device (`K`).
    pub per_device_limit: usize,

    /// Used when a task does not carry its own ceiling.
    pub default_max_attempts: u32,

    /// First retry delay.
    pub base_delay_ms: u64,

    /// Backoff cap.
    pub max_delay_ms: u64,

    /// Per-attempt timeout when a task does not carry one. `None` = no limit.
    pub attempt_timeout_ms: Option<u64>,

    /// How long a cancelled or timed-out attempt may keep running before the
    /// worker stops waiting for it.
    pub cancel_grace_ms: u64,

    /// Terminal tasks are evicted this long after they finish. `None` keeps
    /// them forever.
    pub retention_ms: Option<u64>,

    /// How often the retention sweep runs.
    pub gc_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            per_device_limit: 1,
            default_max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            attempt_timeout_ms: Some(300_000),
            cancel_grace_ms: 5_000,
            retention_ms: Some(3_600_000),
            gc_interval_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Zero { field: "workers" });
        }
        if self.per_device_limit == 0 {
            return Err(ConfigError::Zero {
                field: "per_device_limit",
            });
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "default_max_attempts",
            });
        }
        if self.gc_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "gc_interval_ms",
            });
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::BackoffInverted {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention_ms.map(Duration::from_millis)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}
