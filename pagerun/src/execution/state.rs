//! Lifecycle states of a stage execution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a stage execution is in its lifecycle.
///
/// ```text
/// Idle ──▶ Running ──┬──▶ Completed
///                    ├──▶ Failed
///                    └──▶ Cancelled
/// ```
///
/// The three terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Created, not yet accepted by the engine.
    #[default]
    Idle,
    /// Accepted and registered; the tool is being prepared or running.
    Running,
    /// Tool exited successfully and post-processing finished.
    Completed,
    /// Launch, exit status, storage or post-processing failure.
    Failed,
    /// Stopped on request.
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Whether the execution occupies its stage for conflict purposes.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionState::Running)
    }

    /// Whether a cancel request still has something to stop.
    pub fn can_cancel(&self) -> bool {
        self.is_active()
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        match self {
            ExecutionState::Idle => next == ExecutionState::Running,
            ExecutionState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
