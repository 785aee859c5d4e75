//! Command executor - validates and carries out base-station commands

use crate::state::DeviceState;
use fleet_shared::{
    Ack, Directive, DirectiveKind, Envelope, Message, MovementCommand, Position, Role, TaskCompleted,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Result of command execution
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// Command accepted and completed
    Completed { message: String },
    /// Command rejected (wrong role, busy, not a command)
    Rejected { message: String },
    /// Command accepted and running; its outcome is reported later
    Pending,
}

/// Executes commands received on the command port
pub struct CommandExecutor {
    device_id: String,
    state: Arc<DeviceState>,
    /// Session to the base station
    outbound: mpsc::Sender<Envelope>,
    /// Simulated travel speed, units per second
    speed: f64,
    /// Upper bound on one simulated trip
    max_travel: Duration,
}

impl CommandExecutor {
    pub fn new(device_id: String, state: Arc<DeviceState>, outbound: mpsc::Sender<Envelope>, speed: f64) -> Self {
        Self {
            device_id,
            state,
            outbound,
            speed: speed.max(0.1),
            max_travel: Duration::from_secs(30),
        }
    }

    /// Execute a command and acknowledge it over the session
    pub async fn handle(self: &Arc<Self>, envelope: &Envelope) {
        let (result, reference) = self.execute(envelope).await;
        let ack = match result {
            CommandResult::Completed { message } => {
                info!(%message, "command completed");
                Ack::ok(message, reference)
            }
            CommandResult::Rejected { message } => {
                warn!(%message, "command rejected");
                Ack {
                    reference,
                    ..Ack::failed(message)
                }
            }
            CommandResult::Pending => Ack::ok("accepted", reference),
        };
        self.send(Message::Ack(ack)).await;
    }

    /// Execute a command. Returns the outcome and what it refers to.
    pub async fn execute(self: &Arc<Self>, envelope: &Envelope) -> (CommandResult, Option<String>) {
        match &envelope.message {
            Message::MovementCommand(movement) => {
                (self.start_movement(movement).await, Some(movement.task_id.clone()))
            }
            Message::Directive(directive) => {
                (self.apply_directive(directive).await, Some(directive.command.to_string()))
            }
            other => (
                CommandResult::Rejected {
                    message: format!("{} is not a command", other.message_type()),
                },
                None,
            ),
        }
    }

    async fn start_movement(self: &Arc<Self>, movement: &MovementCommand) -> CommandResult {
        let snapshot = self.state.snapshot().await;
        if snapshot.role != Role::Robot {
            return CommandResult::Rejected {
                message: "only robots accept movement commands".into(),
            };
        }
        if snapshot.task_id.as_deref() == Some(movement.task_id.as_str()) {
            return CommandResult::Completed {
                message: format!("already working on task {}", movement.task_id),
            };
        }
        if !self.state.begin_task(&movement.task_id).await {
            return CommandResult::Rejected {
                message: format!("busy with task {}", snapshot.task_id.unwrap_or_default()),
            };
        }

        let travel = self.travel_time(snapshot.position, movement.coordinates);
        info!(
            task_id = %movement.task_id,
            issue_type = %movement.issue_type,
            target = %movement.coordinates,
            travel = ?travel,
            "moving to task location"
        );

        let executor = self.clone();
        let movement = movement.clone();
        tokio::spawn(async move {
            tokio::time::sleep(travel).await;
            executor.state.arrive(movement.coordinates).await;
            executor.state.finish_task().await;
            info!(task_id = %movement.task_id, "task finished");

            let done = TaskCompleted {
                task_id: movement.task_id.clone(),
                status: Some("completed".into()),
                message: Some(format!("{} resolved at {}", movement.issue_type, movement.coordinates)),
            };
            executor.send(Message::TaskCompleted(done)).await;
        });

        CommandResult::Pending
    }

    async fn apply_directive(self: &Arc<Self>, directive: &Directive) -> CommandResult {
        let role = self.state.snapshot().await.role;
        let status = match directive.command {
            DirectiveKind::Engage => "ENGAGED",
            DirectiveKind::Ground => "GROUNDED",
            DirectiveKind::StartDetection if role == Role::Drone => "DETECTING",
            DirectiveKind::StartDetection => {
                return CommandResult::Rejected {
                    message: "robots do not run detection".into(),
                }
            }
            DirectiveKind::ReturnHome => {
                self.return_home().await;
                return CommandResult::Pending;
            }
        };
        self.state.set_status(status).await;
        CommandResult::Completed {
            message: format!("{} -> {}", directive.command, status),
        }
    }

    async fn return_home(self: &Arc<Self>) {
        let snapshot = self.state.snapshot().await;
        let home = self.state.home();
        let travel = self.travel_time(snapshot.position, home);
        self.state.set_status("RETURNING").await;

        let executor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(travel).await;
            executor.state.arrive(home).await;
            executor.state.set_status("IDLE").await;
            info!(position = %home, "back home");
        });
    }

    fn travel_time(&self, from: Position, to: Position) -> Duration {
        Duration::from_secs_f64(from.distance_2d(&to) / self.speed).min(self.max_travel)
    }

    async fn send(&self, message: Message) {
        let envelope = Envelope::message(&self.device_id, message);
        if self.outbound.send(envelope).await.is_err() {
            warn!("session closed, message dropped");
        }
    }
}
