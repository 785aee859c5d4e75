//! Fleet Shared Protocol Types
//!
//! This crate provides the wire protocol, codec and task lifecycle shared
//! between the base station and the drone/robot agents.

pub mod codec;
pub mod protocol;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use protocol::*;

/// Sender id the base station uses on every outbound envelope
pub const BASE_STATION_ID: &str = "base_station";

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Ports and timing parameters for the system
pub mod timing {
    /// Base station port for device-originated traffic
    pub const DEVICE_PORT: u16 = 9998;

    /// Device port for base-station-originated commands
    pub const COMMAND_PORT: u16 = 9999;

    /// Dashboard HTTP API port
    pub const HTTP_PORT: u16 = 5000;

    /// Heartbeat interval in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

    /// A device is stale once no heartbeat arrived for this long
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 10000;

    /// Time a new connection has to complete its DISCOVERY handshake
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

    /// Connect + write timeout for a single command delivery attempt
    pub const SEND_TIMEOUT_MS: u64 = 2000;

    /// Delivery attempts before a device is declared unreachable
    pub const SEND_MAX_ATTEMPTS: u32 = 2;

    /// Pause between delivery attempts
    pub const SEND_RETRY_BACKOFF_MS: u64 = 500;

    /// Battery level at which a device reports BATTERY_LOW
    pub const BATTERY_LOW_PERCENT: u8 = 20;
}

/// Builder helpers for creating envelopes
impl Envelope {
    /// Create a MESSAGE envelope stamped with the current time
    pub fn message(sender_id: impl Into<String>, message: Message) -> Self {
        Self {
            packet_type: PacketType::Message,
            sender_id: sender_id.into(),
            timestamp_ms: now_ms(),
            message,
        }
    }

    /// Create the DISCOVERY handshake a device opens its session with
    pub fn discovery(sender_id: impl Into<String>, discovery: Discovery) -> Self {
        Self {
            packet_type: PacketType::Discovery,
            sender_id: sender_id.into(),
            timestamp_ms: now_ms(),
            message: Message::Discovery(discovery),
        }
    }

    /// Create the base station's answer to a DISCOVERY handshake
    pub fn discovery_ack(ack: Ack) -> Self {
        Self {
            packet_type: PacketType::Discovery,
            sender_id: BASE_STATION_ID.into(),
            timestamp_ms: now_ms(),
            message: Message::Ack(ack),
        }
    }
}

impl Ack {
    /// Create a positive ACK
    pub fn ok(message: impl Into<String>, reference: Option<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            reference,
        }
    }

    /// Create a negative ACK
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            reference: None,
        }
    }
}

impl Heartbeat {
    pub fn new(battery: Option<u8>, position: Option<Position>, status: Option<String>) -> Self {
        Self {
            battery,
            position,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_envelope_creation() {
        let envelope = Envelope::message("ROBOT_7", Message::Heartbeat(Heartbeat::default()));
        assert_eq!(envelope.sender_id, "ROBOT_7");
        assert_eq!(envelope.packet_type, PacketType::Message);
        assert_eq!(envelope.message_type(), MessageType::Heartbeat);
        assert!(envelope.timestamp_ms > 0);
    }

    #[test]
    fn test_discovery_ack_creation() {
        let envelope = Envelope::discovery_ack(Ack::ok("welcome", None));
        assert_eq!(envelope.packet_type, PacketType::Discovery);
        assert_eq!(envelope.sender_id, BASE_STATION_ID);
        assert!(matches!(envelope.message, Message::Ack(ref a) if a.ok));
    }

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0, 10.0);
        let b = Position::new(3.0, 4.0, 0.0);
        assert_eq!(a.distance_2d(&b), 5.0);
    }
}
