//! Connection management for the persistent base-station session
//!
//! This module handles:
//! - The DISCOVERY handshake on every (re)connect
//! - Automatic reconnection with exponential backoff
//! - Heartbeats and bidirectional message streaming

mod manager;

pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager};
