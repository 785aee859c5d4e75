//! Session management for connected drones and robots
//!
//! This module handles:
//! - Accepting device connections and the DISCOVERY handshake
//! - Tracking active sessions per device
//! - Delivering outbound commands with retry and cancellation
//! - Periodic stale-device detection

mod connection;
mod listener;
mod liveness;
mod manager;

pub use connection::{shared_writer, SessionGuard, SessionHandle};
pub use listener::serve;
pub use liveness::LivenessMonitor;
pub use manager::{DeliveryError, RetryPolicy, SessionManager};
