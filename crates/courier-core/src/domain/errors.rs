//! Errors - 境界で呼び出し元へ返すエラー
//!
//! Executor 内部の失敗はここには現れません。それらは TaskRecord の
//! `last_error` / history に記録されます。

use super::ids::TaskId;
use super::state::TaskState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Malformed submission; never retried.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("duplicate task id {0}")]
    DuplicateTask(TaskId),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {id} already finished as {state:?}")]
    AlreadyTerminal { id: TaskId, state: TaskState },

    /// Another writer changed the state first.
    #[error("task {id}: expected state {expected:?}, found {actual:?}")]
    StateConflict {
        id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    /// The state machine has no such edge.
    #[error("task {id}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidTask(msg.into())
    }
}
