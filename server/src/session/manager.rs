//! Session manager for tracking all connected devices

use super::connection::SessionHandle;
use crate::transport::CommandLink;
use bytes::Bytes;
use fleet_shared::timing;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// How outbound commands are retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: timing::SEND_MAX_ATTEMPTS,
            backoff: Duration::from_millis(timing::SEND_RETRY_BACKOFF_MS),
        }
    }
}

/// Why a send gave up, and after how many tries
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryError {
    pub attempts: u32,
    pub reason: String,
}

/// Manages all active device sessions
pub struct SessionManager {
    /// Map of device_id -> session handle
    sessions: RwLock<HashMap<String, SessionHandle>>,
    link: Arc<dyn CommandLink>,
    retry: RetryPolicy,
}

impl SessionManager {
    pub fn new(link: Arc<dyn CommandLink>, retry: RetryPolicy) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            link,
            retry,
        }
    }

    /// Register a device session. A reconnecting device replaces its old session.
    pub async fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(handle.device_id.clone(), handle)
    }

    /// Unregister a session, unless a newer one for the same device took its place
    pub async fn unregister(&self, device_id: &str, session_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(device_id) {
            Some(handle) if handle.session_id == session_id => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    /// Get a session handle for a specific device
    pub async fn get(&self, device_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(device_id).cloned()
    }

    /// Get list of all connected device IDs
    pub async fn connected_devices(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get the number of connected devices
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Deliver a frame to the device's command port, retrying per the policy.
    ///
    /// Pending attempts are abandoned as soon as the device's session closes.
    /// Returns the number of attempts used.
    pub async fn deliver(&self, device_id: &str, frame: Bytes) -> Result<u32, DeliveryError> {
        let Some(handle) = self.get(device_id).await else {
            return Err(DeliveryError {
                attempts: 0,
                reason: "device has no active session".into(),
            });
        };

        let max_attempts = self.retry.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let result = tokio::select! {
                biased;
                _ = handle.closed() => {
                    return Err(DeliveryError { attempts: attempt - 1, reason: "session closed".into() });
                }
                result = self.link.deliver(handle.command_addr, frame.clone()) => result,
            };

            match result {
                Ok(()) => {
                    debug!(device_id, addr = %handle.command_addr, attempt, link = self.link.name(), "command delivered");
                    return Ok(attempt);
                }
                Err(e) => {
                    warn!(
                        device_id,
                        addr = %handle.command_addr,
                        attempt,
                        max_attempts,
                        error = %e,
                        "command delivery attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    biased;
                    _ = handle.closed() => {
                        return Err(DeliveryError { attempts: attempt, reason: "session closed".into() });
                    }
                    _ = tokio::time::sleep(self.retry.backoff) => {}
                }
            }
        }

        Err(DeliveryError {
            attempts: max_attempts,
            reason: last_error,
        })
    }
}
