//! Link abstraction for pluggable command delivery

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

/// Delivers one encoded frame to a device's command port
#[async_trait]
pub trait CommandLink: Send + Sync {
    /// Attempt a single delivery; retries are the caller's concern
    async fn deliver(&self, addr: SocketAddr, frame: Bytes) -> Result<()>;

    /// Human-readable name for this link
    fn name(&self) -> &'static str;
}
