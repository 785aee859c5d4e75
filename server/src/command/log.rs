//! Append-only record of every command the base station sent

use fleet_shared::now_ms;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandLogEntry {
    pub id: u64,
    pub timestamp_ms: u64,
    pub device_id: String,
    /// Command channel the frame was sent to
    pub addr: Option<SocketAddr>,
    pub command: String,
    pub params: Value,
    /// Who asked for the command: "coordinator" or "dashboard"
    pub origin: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct LogState {
    entries: VecDeque<CommandLogEntry>,
    next_id: u64,
}

/// Bounded command history; the oldest entries are dropped first
pub struct CommandLog {
    state: RwLock<LogState>,
    capacity: usize,
}

impl CommandLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(LogState {
                entries: VecDeque::new(),
                next_id: 1,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Record a command about to be sent. Returns its entry id.
    pub async fn append(
        &self,
        device_id: &str,
        addr: Option<SocketAddr>,
        command: &str,
        params: Value,
        origin: &str,
    ) -> u64 {
        let mut state = self.state.write().await;
        let id = state.next_id;
        state.next_id += 1;

        while state.entries.len() >= self.capacity {
            state.entries.pop_front();
        }
        state.entries.push_back(CommandLogEntry {
            id,
            timestamp_ms: now_ms(),
            device_id: device_id.to_string(),
            addr,
            command: command.to_string(),
            params,
            origin: origin.to_string(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            error: None,
        });
        id
    }

    pub async fn mark_delivered(&self, id: u64, attempts: u32) {
        self.update(id, |entry| {
            entry.status = DeliveryStatus::Delivered;
            entry.attempts = attempts;
        })
        .await;
    }

    pub async fn mark_failed(&self, id: u64, attempts: u32, error: &str) {
        self.update(id, |entry| {
            entry.status = DeliveryStatus::Failed;
            entry.attempts = attempts;
            entry.error = Some(error.to_string());
        })
        .await;
    }

    async fn update(&self, id: u64, apply: impl FnOnce(&mut CommandLogEntry)) {
        let mut state = self.state.write().await;
        // Entries are stored in id order
        if let Ok(index) = state.entries.binary_search_by_key(&id, |e| e.id) {
            apply(&mut state.entries[index]);
        }
    }

    pub async fn get(&self, id: u64) -> Option<CommandLogEntry> {
        let state = self.state.read().await;
        state
            .entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|index| state.entries[index].clone())
    }

    /// Most recent entries, newest first
    pub async fn recent(&self, limit: usize) -> Vec<CommandLogEntry> {
        let state = self.state.read().await;
        state.entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }
}
