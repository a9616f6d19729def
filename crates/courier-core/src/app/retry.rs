//! Retry policy: decides what happens after a failed attempt.

use std::time::Duration;

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// No retry waits longer than this.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, given how many attempts were made.
    ///
    /// `delay = base * 2^(attempts - 1)`, capped at `max_delay`.
    ///
    /// Example with base=2s, max=60s:
    /// - attempt 1 failed: 2s
    /// - attempt 2 failed: 4s
    /// - attempt 3 failed: 8s
    /// - attempt 6 failed: 60s (64s capped)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Decision after attempt number `attempts` (of `max_attempts`) failed.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> Decision {
        if attempts < max_attempts {
            Decision::Retry {
                delay: self.next_delay(attempts),
            }
        } else {
            Decision::GiveUp
        }
    }
}

/// The next action for a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Back to Queued, eligible again after `delay`.
    Retry { delay: Duration },

    /// Terminal Failed.
    GiveUp,
}
