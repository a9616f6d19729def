//! Status - 状態別の集計ビュー

use serde::{Deserialize, Serialize};

use crate::domain::TaskState;

/// Number of known tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Queued => self.queued += 1,
            TaskState::Running => self.running += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Cancelled => self.cancelled += 1,
        }
    }

    /// Tasks that have not reached a terminal state.
    pub fn active(&self) -> usize {
        self.queued + self.running
    }

    pub fn total(&self) -> usize {
        self.active() + self.succeeded + self.failed + self.cancelled
    }
}
