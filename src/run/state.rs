//! Run state machine.

use serde::{Deserialize, Serialize};

/// Job logic reported a failure without a structured code.
pub const ERR_UNKNOWN: i32 = -1;
/// The isolated execution context could not be built.
pub const ERR_CONTEXT_ISOLATION: i32 = -2;
/// The run was cancelled through its handle.
pub const ERR_CANCELLED: i32 = -3;
/// The job logic panicked.
pub const ERR_PROCESSOR_PANIC: i32 = -4;
/// The run was in flight when the process stopped.
pub const ERR_INTERRUPTED: i32 = -5;
/// The run queue refused the run at submission.
pub const ERR_REJECTED: i32 = -6;

/// State of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Queued, waiting for a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failed,
}

impl RunState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Pending, Failed) | (Running, Success) | (Running, Failed)
        )
    }

    /// Whether a record in `next` may follow a record in this state. A
    /// non-terminal state may be rewritten in place (a priority change);
    /// nothing follows a terminal state.
    pub fn accepts_update(&self, next: RunState) -> bool {
        (*self == next && !self.is_terminal()) || self.can_transition_to(next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
