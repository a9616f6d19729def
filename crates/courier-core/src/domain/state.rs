//! Task state machine.

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Queued -> Running -> Succeeded
/// - Queued -> Running -> Queued (retry after backoff, while attempts < max_attempts)
/// - Queued -> Running -> Failed (last attempt failed)
/// - Queued -> Cancelled
/// - Running -> Cancelled (cooperative)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in its device queue (possibly gated by backoff).
    Queued,

    /// Owned by exactly one worker.
    Running,

    Succeeded,

    /// Failed permanently (max_attempts reached).
    Failed,

    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Queued,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Succeeded)
                | (Running, Queued)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

/// Why a task ended up `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A caller asked for it.
    Requested,

    /// Still queued or running when the shutdown drain window closed.
    ShutdownTimeout,
}

/// Why an attempt failed. Rendered into `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("{0}")]
    Executor(String),

    #[error("timeout")]
    Timeout,

    #[error("executor panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::succeeded(TaskState::Succeeded)]
    #[case::failed(TaskState::Failed)]
    #[case::cancelled(TaskState::Cancelled)]
    fn terminal_states_have_no_way_out(#[case] terminal: TaskState) {
        assert!(terminal.is_terminal());
        for next in TaskState::ALL {
            assert!(!terminal.can_transition_to(next), "{terminal:?} -> {next:?}");
        }
    }

    #[test]
    fn queued_cannot_skip_running() {
        assert!(!TaskState::Queued.can_transition_to(TaskState::Succeeded));
        assert!(!TaskState::Queued.can_transition_to(TaskState::Failed));
        assert!(TaskState::Running.can_transition_to(TaskState::Queued));
    }

    #[test]
    fn timeout_renders_as_plain_word() {
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
        assert_eq!(
            FailureReason::Executor("device busy".into()).to_string(),
            "device busy"
        );
    }
}
