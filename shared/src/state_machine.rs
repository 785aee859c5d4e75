//! Task Lifecycle State Machine
//!
//! A task only ever moves forward: UNCLAIMED -> CLAIMED -> DONE.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Unclaimed,
    Claimed,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Unclaimed => "UNCLAIMED",
            TaskStatus::Claimed => "CLAIMED",
            TaskStatus::Done => "DONE",
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self, TaskStatus::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that can move a task forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// The full robot set was reserved
    RobotsClaimed,
    /// A claimant reported the work finished
    CompletionReported,
}

/// Result of applying an event to a task status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and the status changed
    Success(TaskStatus),
    /// The event was already applied; nothing changes
    Duplicate(TaskStatus),
    /// Transition is not allowed from the current status
    Invalid { from: TaskStatus, event: TaskEvent },
}

/// Compute the outcome of `event` on a task currently in `from`
pub fn next_status(from: TaskStatus, event: TaskEvent) -> TransitionResult {
    use TaskEvent::*;
    use TaskStatus::*;

    match (from, event) {
        (Unclaimed, RobotsClaimed) => TransitionResult::Success(Claimed),
        (Claimed, CompletionReported) => TransitionResult::Success(Done),

        // At-least-once delivery can repeat a completion
        (Done, CompletionReported) => TransitionResult::Duplicate(Done),

        _ => TransitionResult::Invalid { from, event },
    }
}

/// Check if moving from one status to another is allowed
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;

    match (from, to) {
        (a, b) if a == b => true,
        (Unclaimed, Claimed) => true,
        (Claimed, Done) => true,
        _ => false,
    }
}
