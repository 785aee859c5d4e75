//! Single consumer of robot availability events

use super::engine::TaskCoordinator;
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Drains availability events and re-scans pending tasks
pub struct AvailabilityWorker {
    coordinator: Weak<TaskCoordinator>,
    events: mpsc::UnboundedReceiver<String>,
}

impl AvailabilityWorker {
    pub(super) fn new(coordinator: Weak<TaskCoordinator>, events: mpsc::UnboundedReceiver<String>) -> Self {
        Self { coordinator, events }
    }

    pub async fn run(mut self) {
        while self.step().await {}
        debug!("availability worker stopped");
    }

    /// Wait for the next batch of events and re-scan once for all of them.
    /// Returns false once the coordinator is gone.
    pub async fn step(&mut self) -> bool {
        let Some(first) = self.events.recv().await else {
            return false;
        };
        let mut robots = vec![first];
        while let Ok(robot_id) = self.events.try_recv() {
            robots.push(robot_id);
        }

        let Some(coordinator) = self.coordinator.upgrade() else {
            return false;
        };

        debug!(robots = ?robots, "robot availability changed");
        let claimed = coordinator.rescan_pending().await;
        if !claimed.is_empty() {
            let task_ids: Vec<&str> = claimed.iter().map(|t| t.id.as_str()).collect();
            info!(tasks = ?task_ids, "pending tasks claimed");
        }
        true
    }
}
