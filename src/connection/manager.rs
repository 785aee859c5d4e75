//! Connection manager with persistent connection and automatic reconnection

use crate::state::DeviceState;
use anyhow::{anyhow, Result};
use fleet_shared::{
    codec::{self, FrameDecoder},
    timing, Discovery, Envelope, Message, Role,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

/// Events emitted by the connection manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake with the base station completed
    Connected,
    /// Disconnected from the base station
    Disconnected { reason: String },
    /// Received an envelope from the base station
    Received(Envelope),
    /// A connection attempt failed; a retry follows after backoff
    ConnectionFailed { reason: String },
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub device_id: String,
    pub role: Role,
    /// Base station device port
    pub server: String,
    /// Port this agent accepts commands on, announced in DISCOVERY
    pub command_port: u16,
    pub heartbeat_interval: Duration,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connect and handshake timeout
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_id: "ROBOT_1".into(),
            role: Role::Robot,
            server: format!("127.0.0.1:{}", timing::DEVICE_PORT),
            command_port: timing::COMMAND_PORT,
            heartbeat_interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(timing::HANDSHAKE_TIMEOUT_MS),
        }
    }
}

/// Manages the persistent session to the base station
pub struct ConnectionManager {
    /// Channel to send envelopes to the base station
    outbound_tx: mpsc::Sender<Envelope>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(config: ConnectionConfig, state: Arc<DeviceState>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Envelope>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);

        tokio::spawn(async move {
            connection_loop(config, state, outbound_rx, event_tx).await;
        });

        Self {
            outbound_tx,
            event_rx,
        }
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Get a clone of the sender for outbound messages
    pub fn get_sender(&self) -> mpsc::Sender<Envelope> {
        self.outbound_tx.clone()
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: ConnectionConfig,
    state: Arc<DeviceState>,
    mut outbound_rx: mpsc::Receiver<Envelope>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, open_session(&config, &state)).await {
            Ok(Ok((stream, decoder))) => {
                // Connected successfully
                reconnect_delay = config.reconnect_delay;
                let _ = event_tx.send(ConnectionEvent::Connected).await;

                if let Err(reason) =
                    handle_connection(stream, decoder, &config, &state, &mut outbound_rx, &event_tx).await
                {
                    let _ = event_tx
                        .send(ConnectionEvent::Disconnected {
                            reason: reason.to_string(),
                        })
                        .await;
                }
            }
            Ok(Err(e)) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: e.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                let _ = event_tx
                    .send(ConnectionEvent::ConnectionFailed {
                        reason: format!("no handshake within {:?}", config.connect_timeout),
                    })
                    .await;
            }
        }

        if event_tx.is_closed() {
            debug!("event receiver dropped, stopping connection loop");
            return;
        }

        // Wait before reconnecting
        tokio::time::sleep(reconnect_delay).await;

        // Exponential backoff
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// Connect and complete the DISCOVERY handshake
async fn open_session(config: &ConnectionConfig, state: &DeviceState) -> Result<(TcpStream, FrameDecoder)> {
    let mut stream = TcpStream::connect(&config.server).await?;

    let snapshot = state.snapshot().await;
    let discovery = Discovery {
        role: config.role,
        position: Some(snapshot.position),
        battery: Some(snapshot.battery),
        command_port: Some(config.command_port),
        status: Some(snapshot.status),
    };
    stream
        .write_all(&codec::encode(&Envelope::discovery(&config.device_id, discovery))?)
        .await?;

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];
    loop {
        while let Some(result) = decoder.decode_next() {
            match result {
                Ok(Envelope {
                    message: Message::Ack(ack),
                    ..
                }) if ack.ok => return Ok((stream, decoder)),
                Ok(Envelope {
                    message: Message::Ack(ack),
                    ..
                }) => return Err(anyhow!("handshake refused: {}", ack.message)),
                Ok(other) => debug!(message_type = %other.message_type(), "frame before handshake ACK ignored"),
                Err(e) => warn!(error = %e, "malformed frame during handshake"),
            }
        }

        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            return Err(anyhow!("base station closed connection during handshake"));
        }
        decoder.extend(&read_buf[..n]);
    }
}

/// Handle an active connection
async fn handle_connection(
    stream: TcpStream,
    mut decoder: FrameDecoder,
    config: &ConnectionConfig,
    state: &DeviceState,
    outbound_rx: &mut mpsc::Receiver<Envelope>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = vec![0u8; 4096];

    let mut heartbeat_interval = interval(config.heartbeat_interval);
    heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Send heartbeat
            _ = heartbeat_interval.tick() => {
                let envelope = Envelope::message(&config.device_id, Message::Heartbeat(state.heartbeat().await));
                writer.write_all(&codec::encode(&envelope)?).await?;
            }

            // Send outbound messages
            Some(envelope) = outbound_rx.recv() => {
                writer.write_all(&codec::encode(&envelope)?).await?;
            }

            // Read incoming messages
            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        return Err(anyhow!("Base station closed connection"));
                    }
                    Ok(n) => {
                        decoder.extend(&read_buf[..n]);

                        // Process all complete frames
                        while let Some(result) = decoder.decode_next() {
                            match result {
                                Ok(envelope) => {
                                    let _ = event_tx.send(ConnectionEvent::Received(envelope)).await;
                                }
                                Err(e) => warn!(error = %e, "malformed frame from base station"),
                            }
                        }
                    }
                    Err(e) => {
                        return Err(anyhow!("Read error: {}", e));
                    }
                }
            }
        }
    }
}
