//! Wire protocol types
//!
//! Every frame on the wire is one JSON envelope:
//! ```text
//! {"packet_type": "...", "message_type": "...", "sender_id": "...", "timestamp": 1700000000000, "content": {...}}
//! ```
//! `content` is interpreted according to `message_type` (and, for REQUEST,
//! the `packet_type`): a DISCOVERY REQUEST is a handshake, a MESSAGE REQUEST
//! is a directive from the base station.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Device role declared at discovery. Drones and robots share one id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Drone,
    Robot,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Drone => "DRONE",
            Role::Robot => "ROBOT",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRONE" | "DRONES" => Ok(Role::Drone),
            "ROBOT" | "ROBOTS" => Ok(Role::Robot),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Position in the shared virtual coordinate frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Planar distance, ignoring altitude
    pub fn distance_2d(&self, other: &Position) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Discovery,
    Message,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Discovery => "DISCOVERY",
            PacketType::Message => "MESSAGE",
        }
    }
}

impl FromStr for PacketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DISCOVERY" => Ok(PacketType::Discovery),
            "MESSAGE" => Ok(PacketType::Message),
            other => Err(format!("unknown packet_type {other:?}")),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Request,
    Ack,
    Status,
    /// Issue report from a drone; `QR_SCAN` on the wire, `ISSUE_REPORT` accepted
    IssueReport,
    MovementCommand,
    TaskCompleted,
    Heartbeat,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "REQUEST",
            MessageType::Ack => "ACK",
            MessageType::Status => "STATUS",
            MessageType::IssueReport => "QR_SCAN",
            MessageType::MovementCommand => "MOVEMENT_COMMAND",
            MessageType::TaskCompleted => "TASK_COMPLETED",
            MessageType::Heartbeat => "HEARTBEAT",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUEST" => Ok(MessageType::Request),
            "ACK" => Ok(MessageType::Ack),
            "STATUS" => Ok(MessageType::Status),
            "QR_SCAN" | "ISSUE_REPORT" => Ok(MessageType::IssueReport),
            "MOVEMENT_COMMAND" => Ok(MessageType::MovementCommand),
            "TASK_COMPLETED" => Ok(MessageType::TaskCompleted),
            "HEARTBEAT" => Ok(MessageType::Heartbeat),
            other => Err(format!("unknown message_type {other:?}")),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake sent by a device right after connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    /// Port the device listens on for base-station commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Directives the base station can issue outside of task assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectiveKind {
    Engage,
    #[serde(alias = "DISENGAGE")]
    Ground,
    ReturnHome,
    StartDetection,
}

impl DirectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DirectiveKind::Engage => "ENGAGE",
            DirectiveKind::Ground => "GROUND",
            DirectiveKind::ReturnHome => "RETURN_HOME",
            DirectiveKind::StartDetection => "START_DETECTION",
        }
    }
}

impl FromStr for DirectiveKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENGAGE" => Ok(DirectiveKind::Engage),
            "GROUND" | "DISENGAGE" => Ok(DirectiveKind::Ground),
            "RETURN_HOME" => Ok(DirectiveKind::ReturnHome),
            "START_DETECTION" => Ok(DirectiveKind::StartDetection),
            other => Err(format!("unknown directive {other:?}")),
        }
    }
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub command: DirectiveKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    /// Identifier the ACK refers to (task id, command id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// A drone's report of a detected issue
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IssueReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code: Option<String>,
    /// Where the drone observed the issue; informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementCommand {
    pub task_id: String,
    pub issue_type: String,
    pub coordinates: Position,
    #[serde(default = "default_movement")]
    pub command: String,
}

fn default_movement() -> String {
    "move_to_location".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Typed message body, one variant per handled message kind
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Discovery(Discovery),
    Directive(Directive),
    Ack(Ack),
    Status(Status),
    IssueReport(IssueReport),
    MovementCommand(MovementCommand),
    TaskCompleted(TaskCompleted),
    Heartbeat(Heartbeat),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Discovery(_) | Message::Directive(_) => MessageType::Request,
            Message::Ack(_) => MessageType::Ack,
            Message::Status(_) => MessageType::Status,
            Message::IssueReport(_) => MessageType::IssueReport,
            Message::MovementCommand(_) => MessageType::MovementCommand,
            Message::TaskCompleted(_) => MessageType::TaskCompleted,
            Message::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    /// Serialize the body into the envelope's `content` field
    pub fn content(&self) -> serde_json::Result<Value> {
        match self {
            Message::Discovery(m) => serde_json::to_value(m),
            Message::Directive(m) => serde_json::to_value(m),
            Message::Ack(m) => serde_json::to_value(m),
            Message::Status(m) => serde_json::to_value(m),
            Message::IssueReport(m) => serde_json::to_value(m),
            Message::MovementCommand(m) => serde_json::to_value(m),
            Message::TaskCompleted(m) => serde_json::to_value(m),
            Message::Heartbeat(m) => serde_json::to_value(m),
        }
    }

    /// Structural checks serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        let battery = match self {
            Message::Discovery(d) => d.battery,
            Message::Status(s) => s.battery,
            Message::Heartbeat(h) => h.battery,
            _ => None,
        };
        if let Some(level) = battery {
            if level > 100 {
                return Err(format!("battery out of range: {level}"));
            }
        }

        match self {
            Message::IssueReport(report) if report.issue_type.is_none() && report.qr_code.is_none() => {
                Err("issue report needs issue_type or qr_code".into())
            }
            Message::TaskCompleted(done) if done.task_id.trim().is_empty() => {
                Err("task_id must not be empty".into())
            }
            _ => Ok(()),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub packet_type: PacketType,
    pub sender_id: String,
    pub timestamp_ms: u64,
    pub message: Message,
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }
}
