//! Simulated device state shared by the heartbeat, executor and reporter

use fleet_shared::{Heartbeat, Position, Role};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub role: Role,
    pub position: Position,
    pub battery: u8,
    pub status: String,
    pub task_id: Option<String>,
}

pub struct DeviceState {
    home: Position,
    inner: RwLock<Snapshot>,
}

impl DeviceState {
    pub fn new(role: Role, home: Position, battery: u8) -> Self {
        Self {
            home,
            inner: RwLock::new(Snapshot {
                role,
                position: home,
                battery: battery.min(100),
                status: "IDLE".into(),
                task_id: None,
            }),
        }
    }

    pub fn home(&self) -> Position {
        self.home
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    pub async fn heartbeat(&self) -> Heartbeat {
        let s = self.inner.read().await;
        Heartbeat::new(Some(s.battery), Some(s.position), Some(s.status.clone()))
    }

    pub async fn set_status(&self, status: &str) {
        self.inner.write().await.status = status.to_string();
    }

    /// Start work on a task. Returns false if already busy with another one.
    pub async fn begin_task(&self, task_id: &str) -> bool {
        let mut s = self.inner.write().await;
        match &s.task_id {
            Some(current) if current != task_id => false,
            _ => {
                s.task_id = Some(task_id.to_string());
                s.status = "BUSY".into();
                true
            }
        }
    }

    pub async fn finish_task(&self) -> Option<String> {
        let mut s = self.inner.write().await;
        s.status = "IDLE".into();
        s.task_id.take()
    }

    /// Arrive at `target`, draining one percent of battery per 25 units travelled
    pub async fn arrive(&self, target: Position) {
        let mut s = self.inner.write().await;
        let drain = (s.position.distance_2d(&target) / 25.0).round() as u32;
        s.battery = s.battery.saturating_sub(drain.min(u8::MAX as u32) as u8);
        s.position = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_lifecycle() {
        let state = DeviceState::new(Role::Robot, Position::default(), 100);
        assert!(state.begin_task("t1").await);
        assert!(state.begin_task("t1").await);
        assert!(!state.begin_task("t2").await);
        assert_eq!(state.snapshot().await.status, "BUSY");

        assert_eq!(state.finish_task().await.as_deref(), Some("t1"));
        assert_eq!(state.snapshot().await.status, "IDLE");
    }

    #[tokio::test]
    async fn test_arrive_drains_battery() {
        let state = DeviceState::new(Role::Robot, Position::default(), 100);
        state.arrive(Position::new(30.0, 40.0, 0.0)).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.position, Position::new(30.0, 40.0, 0.0));
        assert_eq!(snapshot.battery, 98);
    }
}
