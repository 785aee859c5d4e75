//! Task record and its lifecycle transitions

use crate::error::CoreError;
use crate::issues::IssueLocation;
use fleet_shared::state_machine::{is_valid_transition, next_status, TaskEvent, TaskStatus, TransitionResult};
use fleet_shared::{now_ms, Position};
use serde::Serialize;
use std::collections::BTreeSet;
use uuid::Uuid;

/// One reported issue and the robots working on it
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub issue_type: String,
    pub description: String,
    pub status: TaskStatus,
    /// Empty while UNCLAIMED, exactly `robot_count` robots afterwards
    pub claimed_by: BTreeSet<String>,
    pub robot_count: usize,
    /// Copied from the issue table when the task was created
    pub coordinates: Position,
    pub reported_by: String,
    /// Where the drone saw the issue
    pub reported_coordinates: Option<Position>,
    pub time_detected: u64,
    pub time_claimed: Option<u64>,
    pub time_completed: Option<u64>,
    pub completed_by: Option<String>,
}

/// What a completion report did to the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    /// The task was already DONE; nothing changed
    AlreadyDone,
}

impl Task {
    pub fn new(
        issue_type: &str,
        location: &IssueLocation,
        reported_by: &str,
        reported_coordinates: Option<Position>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            issue_type: issue_type.to_string(),
            description: location.description.clone(),
            status: TaskStatus::Unclaimed,
            claimed_by: BTreeSet::new(),
            robot_count: location.robot_count,
            coordinates: location.coordinates,
            reported_by: reported_by.to_string(),
            reported_coordinates,
            time_detected: now_ms(),
            time_claimed: None,
            time_completed: None,
            completed_by: None,
        }
    }

    fn apply(&mut self, event: TaskEvent) -> TransitionResult {
        let result = next_status(self.status, event);
        if let TransitionResult::Success(to) = result {
            debug_assert!(is_valid_transition(self.status, to));
            self.status = to;
        }
        result
    }

    /// Reserve the full robot set. Returns false if the task was not UNCLAIMED
    /// or the set has the wrong size.
    pub(crate) fn claim(&mut self, robots: BTreeSet<String>) -> bool {
        if robots.len() != self.robot_count || self.status != TaskStatus::Unclaimed {
            return false;
        }
        match self.apply(TaskEvent::RobotsClaimed) {
            TransitionResult::Success(_) => {
                self.claimed_by = robots;
                self.time_claimed = Some(now_ms());
                true
            }
            _ => false,
        }
    }

    /// Record a completion reported by `device_id`
    pub(crate) fn complete(&mut self, device_id: &str) -> Result<Completion, CoreError> {
        let task_id = self.id.clone();
        let not_claimant = || CoreError::NotClaimant {
            task_id: task_id.clone(),
            device_id: device_id.to_string(),
        };

        if !self.claimed_by.contains(device_id) {
            return Err(not_claimant());
        }

        match self.apply(TaskEvent::CompletionReported) {
            TransitionResult::Success(_) => {
                self.time_completed = Some(now_ms());
                self.completed_by = Some(device_id.to_string());
                Ok(Completion::Completed)
            }
            TransitionResult::Duplicate(_) => Ok(Completion::AlreadyDone),
            TransitionResult::Invalid { .. } => Err(not_claimant()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(robot_count: usize) -> IssueLocation {
        IssueLocation {
            coordinates: Position::new(50.0, 75.0, 10.0),
            robot_count,
            description: "Rust detected at location".into(),
            qr_code: None,
        }
    }

    fn robots(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_task_is_unclaimed() {
        let task = Task::new("rust", &location(1), "D1", Some(Position::new(1.0, 1.0, 1.0)));
        assert_eq!(task.status, TaskStatus::Unclaimed);
        assert!(task.claimed_by.is_empty());
        assert_eq!(task.coordinates, Position::new(50.0, 75.0, 10.0));
        assert_eq!(task.reported_coordinates, Some(Position::new(1.0, 1.0, 1.0)));
        assert!(Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn test_claim_requires_full_set() {
        let mut task = Task::new("overheated_circuit", &location(2), "D1", None);
        assert!(!task.claim(robots(&["R1"])));
        assert_eq!(task.status, TaskStatus::Unclaimed);

        assert!(task.claim(robots(&["R1", "R2"])));
        assert_eq!(task.status, TaskStatus::Claimed);
        assert!(task.time_claimed.is_some());

        // Claimed once, never again
        assert!(!task.claim(robots(&["R3", "R4"])));
        assert_eq!(task.claimed_by, robots(&["R1", "R2"]));
    }

    #[test]
    fn test_complete() {
        let mut task = Task::new("rust", &location(1), "D1", None);
        assert!(matches!(task.complete("R1"), Err(CoreError::NotClaimant { .. })));

        task.claim(robots(&["R1"]));
        assert!(matches!(task.complete("R2"), Err(CoreError::NotClaimant { .. })));
        assert_eq!(task.complete("R1"), Ok(Completion::Completed));
        assert_eq!(task.complete("R1"), Ok(Completion::AlreadyDone));
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.completed_by.as_deref(), Some("R1"));
    }
}
