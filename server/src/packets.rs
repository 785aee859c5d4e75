//! Bounded log of network traffic for the dashboard

use fleet_shared::{now_ms, Envelope, BASE_STATION_ID};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct PacketRecord {
    pub timestamp_ms: u64,
    pub direction: Direction,
    pub transport: &'static str,
    pub sender: String,
    pub receiver: String,
    pub peer: Option<SocketAddr>,
    pub packet_type: String,
    pub message_type: String,
    pub payload: Value,
}

impl PacketRecord {
    fn new(
        direction: Direction,
        receiver: &str,
        peer: Option<SocketAddr>,
        transport: &'static str,
        envelope: &Envelope,
    ) -> Self {
        Self {
            timestamp_ms: now_ms(),
            direction,
            transport,
            sender: envelope.sender_id.clone(),
            receiver: receiver.to_string(),
            peer,
            packet_type: envelope.packet_type.to_string(),
            message_type: envelope.message_type().to_string(),
            payload: envelope.message.content().unwrap_or(Value::Null),
        }
    }
}

pub struct PacketLog {
    records: Mutex<VecDeque<PacketRecord>>,
    capacity: usize,
}

impl PacketLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// A frame a device sent to the base station
    pub async fn record_inbound(&self, peer: SocketAddr, envelope: &Envelope) {
        let record = PacketRecord::new(Direction::Inbound, BASE_STATION_ID, Some(peer), "TCP", envelope);
        self.push(record).await;
    }

    /// A frame the base station sent to `device_id`
    pub async fn record_outbound(
        &self,
        device_id: &str,
        peer: Option<SocketAddr>,
        transport: &'static str,
        envelope: &Envelope,
    ) {
        let record = PacketRecord::new(Direction::Outbound, device_id, peer, transport, envelope);
        self.push(record).await;
    }

    async fn push(&self, record: PacketRecord) {
        let mut records = self.records.lock().await;
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent records, newest first
    pub async fn recent(&self, limit: usize) -> Vec<PacketRecord> {
        let records = self.records.lock().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    pub async fn clear(&self) {
        self.records.lock().await.clear();
    }
}
