//! Attempt history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    Cancelled,

    /// The executor ignored the cancellation signal past the grace period;
    /// its call may still be running in the background.
    Abandoned,
}

/// A finished execution attempt of a task.
///
/// Records when the attempt ran and how it ended, so a task's status can
/// explain why it is where it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn new(
        number: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: AttemptOutcome,
    ) -> Self {
        Self {
            number,
            started_at,
            finished_at,
            outcome,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
