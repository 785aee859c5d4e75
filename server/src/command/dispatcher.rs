//! Command dispatcher for sending commands to drones and robots

use super::log::CommandLog;
use crate::error::CoreError;
use crate::packets::PacketLog;
use crate::registry::DeviceRegistry;
use crate::session::{DeliveryError, SessionManager};
use fleet_shared::{codec, Directive, Envelope, Message, MovementCommand, Role, BASE_STATION_ID};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Command issued by the task coordinator
pub const ORIGIN_COORDINATOR: &str = "coordinator";
/// Command issued through the HTTP API
pub const ORIGIN_DASHBOARD: &str = "dashboard";

/// Anything the base station can send to a device
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Directive(Directive),
    Movement(MovementCommand),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Directive(d) => d.command.as_str(),
            Command::Movement(m) => &m.command,
        }
    }

    fn message(&self) -> Message {
        match self {
            Command::Directive(d) => Message::Directive(d.clone()),
            Command::Movement(m) => Message::MovementCommand(m.clone()),
        }
    }

    /// Parameters recorded in the command log
    pub fn params(&self) -> Value {
        match self {
            Command::Directive(d) => d.params.clone().unwrap_or(Value::Null),
            Command::Movement(m) => serde_json::json!({
                "task_id": m.task_id,
                "issue_type": m.issue_type,
                "coordinates": m.coordinates,
            }),
        }
    }
}

/// Successful delivery of one command
#[derive(Debug, Clone, Serialize)]
pub struct CommandReceipt {
    pub log_id: u64,
    pub device_id: String,
    pub command: String,
    pub attempts: u32,
}

/// Dispatches commands to devices and records every attempt
pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    commands: Arc<CommandLog>,
    packets: Arc<PacketLog>,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sessions: Arc<SessionManager>,
        commands: Arc<CommandLog>,
        packets: Arc<PacketLog>,
    ) -> Self {
        Self {
            registry,
            sessions,
            commands,
            packets,
        }
    }

    /// Send a command to a specific device.
    ///
    /// The command log entry is written before the network send, so a failed
    /// delivery still leaves a record. Exhausted retries flag the device stale.
    pub async fn send(
        &self,
        device_id: &str,
        command: Command,
        origin: &str,
    ) -> Result<CommandReceipt, CoreError> {
        let device = self.registry.get(device_id).await?;
        let name = command.name().to_string();
        let log_id = self
            .commands
            .append(device_id, device.command_addr(), &name, command.params(), origin)
            .await;

        let envelope = Envelope::message(BASE_STATION_ID, command.message());
        let frame = match codec::encode(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                self.commands.mark_failed(log_id, 0, &e.to_string()).await;
                return Err(e.into());
            }
        };
        self.packets
            .record_outbound(device_id, device.command_addr(), "TCP", &envelope)
            .await;

        match self.sessions.deliver(device_id, frame).await {
            Ok(attempts) => {
                self.commands.mark_delivered(log_id, attempts).await;
                info!(
                    device_id,
                    command = %name,
                    origin,
                    addr = ?device.addr,
                    attempts,
                    "command delivered"
                );
                Ok(CommandReceipt {
                    log_id,
                    device_id: device_id.to_string(),
                    command: name,
                    attempts,
                })
            }
            Err(DeliveryError { attempts, reason }) => {
                self.commands.mark_failed(log_id, attempts, &reason).await;
                warn!(
                    device_id,
                    command = %name,
                    origin,
                    addr = ?device.addr,
                    attempts,
                    error = %reason,
                    "command delivery failed"
                );
                if self.registry.mark_stale(device_id).await {
                    warn!(device_id, "device unreachable, flagged stale");
                }
                Err(CoreError::DeliveryFailed {
                    device_id: device_id.to_string(),
                    attempts,
                    reason,
                })
            }
        }
    }

    /// Send a directive to every known device of a role
    pub async fn broadcast(
        &self,
        role: Role,
        directive: Directive,
        origin: &str,
    ) -> Vec<(String, Result<CommandReceipt, CoreError>)> {
        let devices = self.registry.list(Some(role)).await;
        let sends = devices.into_iter().map(|device| {
            let command = Command::Directive(directive.clone());
            async move {
                let result = self.send(&device.id, command, origin).await;
                (device.id, result)
            }
        });
        futures::future::join_all(sends).await
    }
}
