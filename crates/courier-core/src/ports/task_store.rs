//! TaskStore port - すべてのタスク状態の正本（source of truth）
//!
//! # 設計原則
//! - 状態を書き換える手段は `compare_and_swap` だけ
//! - 実装は 1 つの同期規律（ロック 1 本など）で全レコードを守る
//! - 操作はすべて短い同期処理で、ロックを保持したまま await しない

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::app::status::StateCounts;
use crate::domain::{DeviceId, SchedulerError, Task, TaskId, TaskState, UploadId};
use crate::store::{TaskRecord, TaskSnapshot};

/// What the dispatcher needs to know to decide whether a queued id is claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub state: TaskState,
    pub next_eligible_at: Option<Instant>,
}

impl Readiness {
    pub fn is_ready(&self, now: Instant) -> bool {
        self.state == TaskState::Queued && self.next_eligible_at.is_none_or(|at| at <= now)
    }
}

pub trait TaskStore: Send + Sync {
    /// Fails with `DuplicateTask` if the id was ever stored.
    fn insert(&self, record: TaskRecord) -> Result<(), SchedulerError>;

    fn get(&self, id: TaskId) -> Result<TaskSnapshot, SchedulerError>;

    fn readiness(&self, id: TaskId) -> Result<Readiness, SchedulerError>;

    /// Atomically: check the current state is `expected`, run `mutator`,
    /// set the state to `new` and commit.
    ///
    /// Fails with `StateConflict` if someone else moved the task first and
    /// with `IllegalTransition` if `expected -> new` is not an edge of the
    /// state machine. The mutator is not run on failure.
    fn compare_and_swap(
        &self,
        id: TaskId,
        expected: TaskState,
        new: TaskState,
        mutator: &mut dyn FnMut(&mut TaskRecord),
    ) -> Result<TaskSnapshot, SchedulerError>;

    /// Lazily yields snapshots matching `filter`. The set of ids is fixed
    /// when the call is made; each record is read as the iterator reaches it.
    fn list(&self, filter: TaskFilter) -> Box<dyn Iterator<Item = TaskSnapshot> + Send + '_>;

    /// Removes terminal tasks last updated at or before `cutoff`.
    fn evict_terminal(&self, cutoff: DateTime<Utc>) -> Vec<TaskId>;

    fn counts(&self) -> StateCounts;

    /// CAS without a mutator.
    fn transition(
        &self,
        id: TaskId,
        expected: TaskState,
        new: TaskState,
    ) -> Result<TaskSnapshot, SchedulerError> {
        self.compare_and_swap(id, expected, new, &mut |_| {})
    }
}

/// Predicate for [`TaskStore::list`]. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    device: Option<DeviceId>,
    states: Vec<TaskState>,
    upload: Option<UploadId>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Queued or Running.
    pub fn active() -> Self {
        Self::all().state(TaskState::Queued).state(TaskState::Running)
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(DeviceId::new(device));
        self
    }

    /// Adds `state` to the accepted set.
    pub fn state(mut self, state: TaskState) -> Self {
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    pub fn upload(mut self, upload: UploadId) -> Self {
        self.upload = Some(upload);
        self
    }

    pub fn matches(&self, task: &Task, state: TaskState) -> bool {
        self.device.as_ref().is_none_or(|d| d == task.device_id())
            && (self.states.is_empty() || self.states.contains(&state))
            && self.upload.is_none_or(|u| task.upload_id() == Some(u))
    }
}
