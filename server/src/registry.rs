//! Device registry: every drone and robot the base station has heard from

use crate::error::CoreError;
use fleet_shared::{now_ms, timing, Message, Position, Role};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// A known drone or robot
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub role: Role,
    pub battery: Option<u8>,
    pub position: Option<Position>,
    pub status: String,
    #[serde(skip)]
    pub last_seen: Instant,
    /// Wall-clock mirror of `last_seen` for the dashboard
    pub last_seen_ms: u64,
    pub first_seen_ms: u64,
    pub addr: Option<IpAddr>,
    pub command_port: u16,
    /// Task this robot is currently claimed by
    pub task_id: Option<String>,
    /// Sequence number of the robot's latest claim, 0 if never assigned
    pub last_assigned: u64,
    pub stale: bool,
}

impl Device {
    fn new(id: &str, role: Role) -> Self {
        let now = now_ms();
        Self {
            id: id.to_string(),
            role,
            battery: None,
            position: None,
            status: "ACTIVE".into(),
            last_seen: Instant::now(),
            last_seen_ms: now,
            first_seen_ms: now,
            addr: None,
            command_port: timing::COMMAND_PORT,
            task_id: None,
            last_assigned: 0,
            stale: false,
        }
    }

    /// Where base-station commands for this device are delivered
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.addr.map(|ip| SocketAddr::new(ip, self.command_port))
    }

    pub fn is_busy(&self) -> bool {
        self.task_id.is_some()
    }

    fn is_live(&self, timeout: Duration) -> bool {
        !self.stale && self.last_seen.elapsed() <= timeout
    }
}

/// Fields carried by a single inbound message; `None` leaves the stored value alone
#[derive(Debug, Clone, Default)]
pub struct DeviceUpdate {
    pub battery: Option<u8>,
    pub position: Option<Position>,
    pub status: Option<String>,
    pub addr: Option<IpAddr>,
    pub command_port: Option<u16>,
}

impl DeviceUpdate {
    /// Extract the device-state fields a message carries
    pub fn from_message(message: &Message) -> Self {
        match message {
            Message::Discovery(d) => Self {
                battery: d.battery,
                position: d.position,
                status: d.status.clone(),
                addr: None,
                command_port: d.command_port,
            },
            Message::Heartbeat(hb) => Self {
                battery: hb.battery,
                position: hb.position,
                status: hb.status.clone(),
                ..Default::default()
            },
            Message::Status(s) => Self {
                battery: s.battery,
                position: s.position,
                status: Some(s.status.clone()),
                ..Default::default()
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    /// The device had been flagged stale and is live again
    Revived,
    Updated,
}

/// Tracks all known devices
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
    liveness_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            liveness_timeout,
        }
    }

    /// Create or refresh a device. Values from this message always win.
    pub async fn upsert(&self, id: &str, role: Role, update: DeviceUpdate) -> UpsertOutcome {
        let mut devices = self.devices.write().await;

        // Not yet swept but already past the timeout also counts as a revival
        let outcome = match devices.get(id) {
            None => UpsertOutcome::Created,
            Some(device) if !device.is_live(self.liveness_timeout) => UpsertOutcome::Revived,
            Some(_) => UpsertOutcome::Updated,
        };

        let device = devices
            .entry(id.to_string())
            .or_insert_with(|| Device::new(id, role));

        if device.role != role {
            if device.is_busy() {
                warn!(
                    device_id = id,
                    role = %device.role,
                    requested = %role,
                    task_id = ?device.task_id,
                    "role change refused while claimed"
                );
            } else {
                warn!(device_id = id, from = %device.role, to = %role, "device changed role");
                device.role = role;
            }
        }
        device.last_seen = Instant::now();
        device.last_seen_ms = now_ms();
        device.stale = false;

        if let Some(battery) = update.battery {
            device.battery = Some(battery.min(100));
            if update.status.is_none() && battery <= timing::BATTERY_LOW_PERCENT {
                device.status = "BATTERY_LOW".into();
            }
        }
        if let Some(position) = update.position {
            device.position = Some(position);
        }
        if let Some(status) = update.status {
            device.status = status;
        }
        if let Some(addr) = update.addr {
            device.addr = Some(addr);
        }
        if let Some(port) = update.command_port {
            device.command_port = port;
        }

        outcome
    }

    /// Refresh liveness of a known device without changing its fields
    pub async fn touch(&self, id: &str) -> Result<UpsertOutcome, CoreError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| CoreError::UnknownDevice(id.to_string()))?;

        let outcome = if device.is_live(self.liveness_timeout) {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Revived
        };
        device.last_seen = Instant::now();
        device.last_seen_ms = now_ms();
        device.stale = false;
        Ok(outcome)
    }

    /// Get a snapshot of one device
    pub async fn get(&self, id: &str) -> Result<Device, CoreError> {
        self.devices
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownDevice(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.devices.read().await.contains_key(id)
    }

    /// Point-in-time copy of all devices (optionally of one role), ordered by id
    pub async fn list(&self, role: Option<Role>) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut snapshot: Vec<Device> = devices
            .values()
            .filter(|d| role.map_or(true, |r| d.role == r))
            .cloned()
            .collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// Robots with no claim that are not stale
    pub async fn idle_robots(&self) -> Vec<Device> {
        let devices = self.devices.read().await;
        devices
            .values()
            .filter(|d| d.role == Role::Robot && !d.is_busy() && d.is_live(self.liveness_timeout))
            .cloned()
            .collect()
    }

    /// Flag a device stale. Returns true if it was live before.
    pub async fn mark_stale(&self, id: &str) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(id) {
            Some(device) if !device.stale => {
                device.stale = true;
                true
            }
            _ => false,
        }
    }

    /// Flag every device not heard from within the liveness timeout.
    /// Returns the ids that became stale in this sweep.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let mut devices = self.devices.write().await;
        let mut newly_stale: Vec<String> = devices
            .values_mut()
            .filter(|d| !d.stale && d.last_seen.elapsed() > self.liveness_timeout)
            .map(|d| {
                d.stale = true;
                d.id.clone()
            })
            .collect();
        newly_stale.sort();
        newly_stale
    }

    /// Record a claim on a set of robots. Only the task coordinator calls this,
    /// while holding its claim lock.
    pub(crate) async fn set_assignment(&self, ids: &[String], task_id: &str, sequence: u64) {
        let mut devices = self.devices.write().await;
        for id in ids {
            if let Some(device) = devices.get_mut(id) {
                device.task_id = Some(task_id.to_string());
                device.last_assigned = sequence;
            }
        }
    }

    /// Release robots claimed by `task_id`. Returns the ids actually released.
    pub(crate) async fn clear_assignment(&self, ids: &[String], task_id: &str) -> Vec<String> {
        let mut devices = self.devices.write().await;
        let mut released = Vec::new();
        for id in ids {
            if let Some(device) = devices.get_mut(id) {
                if device.task_id.as_deref() == Some(task_id) {
                    device.task_id = None;
                    released.push(id.clone());
                }
            }
        }
        released
    }

    pub async fn count(&self) -> usize {
        self.devices.read().await.len()
    }
}
