//! Individual device session handling

use anyhow::Result;
use fleet_shared::{
    codec::{self, CodecError, FrameDecoder},
    Envelope, Role,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::warn;

/// Write side of a session, shared between the worker and its handles
pub type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn shared_writer<W>(writer: W) -> SharedWriter
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Handle to reach a specific connected device
#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: String,
    pub role: Role,
    pub addr: SocketAddr,
    /// Where commands for this device are delivered
    pub command_addr: SocketAddr,
    pub session_id: u64,
    writer: SharedWriter,
    closed: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Create a handle plus the guard whose drop marks the session closed
    pub fn new(
        device_id: impl Into<String>,
        role: Role,
        addr: SocketAddr,
        command_addr: SocketAddr,
        writer: SharedWriter,
    ) -> (Self, SessionGuard) {
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = Self {
            device_id: device_id.into(),
            role,
            addr,
            command_addr,
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            writer,
            closed: closed_rx,
        };
        (handle, SessionGuard { closed: closed_tx })
    }

    /// Send an envelope back over the session connection
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let encoded = codec::encode(envelope)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Resolves once the session has ended
    pub async fn closed(&self) {
        let mut rx = self.closed.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Owned by the session worker; dropping it cancels the device's pending sends
pub struct SessionGuard {
    closed: watch::Sender<bool>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.closed.send_replace(true);
    }
}

/// Read side of an active device connection
pub struct DeviceSession {
    addr: SocketAddr,
    reader: OwnedReadHalf,
    writer: SharedWriter,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl DeviceSession {
    /// Create a new device session from a TCP stream
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            addr,
            reader,
            writer: shared_writer(writer),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Read the next frame from this session
    ///
    /// Returns `None` once the connection is closed. A malformed frame comes
    /// back as `Some(Err(..))`; the session stays usable.
    pub async fn recv(&mut self) -> Option<Result<Envelope, CodecError>> {
        loop {
            // First try to decode from existing buffer
            if let Some(result) = self.decoder.decode_next() {
                return Some(result);
            }

            // Read more data
            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None, // Connection closed
                Ok(n) => {
                    self.decoder.extend(&self.read_buf[..n]);
                }
                Err(e) => {
                    warn!(addr = %self.addr, error = %e, "read error");
                    return None;
                }
            }
        }
    }

    /// Write half, shared with the session handle
    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    /// Get the remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}
