//! Task record: descriptor + execution state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::domain::{
    AttemptOutcome, AttemptRecord, CancelReason, DeviceId, Receipt, Task, TaskId, TaskState,
};

/// Descriptor + execution state for a task in the store.
///
/// Design:
/// - This is the single source of truth for task state.
/// - Dispatch queues hold TaskId only.
/// - `state` is only ever written by the store's compare-and-swap; the
///   helpers below do the bookkeeping that goes with a transition.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub state: TaskState,

    /// Number of attempts started (including the current one if Running).
    pub attempts: u32,
    pub max_attempts: u32,

    /// Present only when `state == Failed`.
    pub last_error: Option<String>,

    /// Present only when `state == Cancelled`.
    pub cancel_reason: Option<CancelReason>,

    /// Dispatch gate: a queued task is skipped until this instant
    /// (retry backoff or `not_before`).
    pub next_eligible_at: Option<Instant>,

    pub receipt: Option<Receipt>,
    pub history: Vec<AttemptRecord>,

    /// Start of the attempt in flight.
    pub running_since: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// New queued record. `task` must already carry its max_attempts.
    pub fn new(task: Task, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            task,
            state: TaskState::Queued,
            attempts: 0,
            max_attempts,
            last_error: None,
            cancel_reason: None,
            next_eligible_at: None,
            receipt: None,
            history: Vec::new(),
            running_since: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn device_id(&self) -> &DeviceId {
        self.task.device_id()
    }

    pub fn with_gate(mut self, next_eligible_at: Option<Instant>) -> Self {
        self.next_eligible_at = next_eligible_at;
        self
    }

    /// Bookkeeping for Queued -> Running.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        debug_assert!(self.attempts < self.max_attempts);
        self.attempts += 1;
        self.next_eligible_at = None;
        self.running_since = Some(now);
    }

    /// Appends the finished attempt to the history.
    pub fn finish_attempt(&mut self, outcome: AttemptOutcome, now: DateTime<Utc>) {
        let started_at = self.running_since.take().unwrap_or(now);
        self.history
            .push(AttemptRecord::new(self.attempts, started_at, now, outcome));
    }

    pub fn retries_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Clears fields that only make sense in other states. Called by the
    /// store after every committed transition.
    pub(crate) fn normalize(&mut self) {
        if self.state != TaskState::Failed {
            self.last_error = None;
        }
        if self.state != TaskState::Cancelled {
            self.cancel_reason = None;
        }
        if self.state != TaskState::Queued {
            self.next_eligible_at = None;
        }
        if self.state != TaskState::Running {
            self.running_since = None;
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task: self.task.clone(),
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            cancel_reason: self.cancel_reason,
            receipt: self.receipt.clone(),
            history: self.history.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only copy of a task's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task: Task,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn device_id(&self) -> &DeviceId {
        self.task.device_id()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
