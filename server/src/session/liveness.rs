//! Periodic stale-device detection

use crate::registry::DeviceRegistry;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::warn;

/// Flags devices whose heartbeats stopped. Never closes connections.
pub struct LivenessMonitor {
    registry: Arc<DeviceRegistry>,
    check_interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<DeviceRegistry>, check_interval: Duration) -> Self {
        Self {
            registry,
            check_interval,
        }
    }

    /// Start the monitoring loop
    pub async fn run(&self) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One pass; returns the devices that went stale
    pub async fn sweep(&self) -> Vec<String> {
        let stale = self.registry.sweep_stale().await;
        for device_id in &stale {
            warn!(device_id = %device_id, "no heartbeat within timeout, device flagged stale");
        }
        stale
    }
}
