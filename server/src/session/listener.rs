//! Device-facing TCP listener: handshake, then one worker per connection

use super::connection::{DeviceSession, SessionHandle};
use crate::handler;
use crate::registry::DeviceUpdate;
use crate::station::BaseStation;
use anyhow::Result;
use fleet_shared::{timing, Ack, Discovery, Envelope, Message, Role};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accept device connections forever
pub async fn serve(listener: TcpListener, station: Arc<BaseStation>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let station = station.clone();
                tokio::spawn(async move {
                    handle_connection(station, stream, addr).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Run one device connection until it closes
pub async fn handle_connection(station: Arc<BaseStation>, stream: TcpStream, addr: SocketAddr) {
    info!(%addr, "connection accepted");
    let mut session = DeviceSession::new(stream, addr);

    let handshake = tokio::time::timeout(
        station.config.handshake_timeout,
        await_discovery(&station, &mut session),
    )
    .await;
    let (device_id, discovery) = match handshake {
        Ok(Some(found)) => found,
        Ok(None) => {
            info!(%addr, "connection closed before DISCOVERY");
            return;
        }
        Err(_) => {
            warn!(%addr, timeout = ?station.config.handshake_timeout, "no DISCOVERY in time, dropping connection");
            return;
        }
    };

    let role = discovery.role;
    let message = Message::Discovery(discovery);
    let update = DeviceUpdate {
        addr: Some(addr.ip()),
        ..DeviceUpdate::from_message(&message)
    };
    let outcome = station.registry.upsert(&device_id, role, update).await;

    let command_addr = station
        .registry
        .get(&device_id)
        .await
        .ok()
        .and_then(|device| device.command_addr())
        .unwrap_or_else(|| SocketAddr::new(addr.ip(), timing::COMMAND_PORT));

    let (handle, _guard) = SessionHandle::new(device_id.clone(), role, addr, command_addr, session.writer());
    if let Some(previous) = station.sessions.register(handle.clone()).await {
        info!(device_id = %device_id, previous_addr = %previous.addr, "replacing existing session");
    }
    info!(device_id = %device_id, %role, %addr, %command_addr, outcome = ?outcome, "device connected");

    let ack = Envelope::discovery_ack(Ack::ok(format!("welcome {device_id}"), None));
    if let Err(e) = send_reply(&station, &handle, &ack).await {
        warn!(device_id = %device_id, %addr, error = %e, "failed to acknowledge DISCOVERY");
        station.sessions.unregister(&device_id, handle.session_id).await;
        return;
    }

    if role == Role::Robot {
        station.coordinator.robot_available(&device_id);
    }

    while let Some(result) = session.recv().await {
        match result {
            Ok(envelope) => {
                if let Some(reply) = handler::handle_envelope(&station, &handle, envelope).await {
                    if let Err(e) = send_reply(&station, &handle, &reply).await {
                        warn!(device_id = %device_id, %addr, error = %e, "failed to send reply");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(device_id = %device_id, %addr, error = %e, "malformed frame dropped");
            }
        }
    }

    station.sessions.unregister(&device_id, handle.session_id).await;
    info!(device_id = %device_id, %addr, "device disconnected");
}

/// Skip frames until a DISCOVERY REQUEST arrives
async fn await_discovery(station: &BaseStation, session: &mut DeviceSession) -> Option<(String, Discovery)> {
    let addr = session.addr();
    while let Some(result) = session.recv().await {
        match result {
            Ok(envelope) => {
                station.packets.record_inbound(addr, &envelope).await;
                match envelope.message {
                    Message::Discovery(discovery) => return Some((envelope.sender_id, discovery)),
                    other => {
                        debug!(%addr, message_type = %other.message_type(), "frame before DISCOVERY ignored");
                    }
                }
            }
            Err(e) => warn!(%addr, error = %e, "malformed frame during handshake"),
        }
    }
    None
}

async fn send_reply(station: &BaseStation, handle: &SessionHandle, envelope: &Envelope) -> Result<()> {
    station
        .packets
        .record_outbound(&handle.device_id, Some(handle.addr), "TCP", envelope)
        .await;
    handle.send(envelope).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::issues::IssueResolver;
    use crate::station::testing::{test_config, RecordingLink};
    use fleet_shared::codec::{self, FrameDecoder};
    use fleet_shared::state_machine::TaskStatus;
    use fleet_shared::{Heartbeat, IssueReport, PacketType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(config: ServerConfig) -> (Arc<BaseStation>, SocketAddr) {
        let (station, worker) = BaseStation::new(config, IssueResolver::builtin(), Arc::new(RecordingLink::default()));
        tokio::spawn(worker.run());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, station.clone()));
        (station, addr)
    }

    struct Client {
        stream: TcpStream,
        decoder: FrameDecoder,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                decoder: FrameDecoder::new(),
            }
        }

        async fn send(&mut self, envelope: &Envelope) {
            self.stream.write_all(&codec::encode(envelope).unwrap()).await.unwrap();
        }

        async fn recv(&mut self) -> Envelope {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(result) = self.decoder.decode_next() {
                    return result.unwrap();
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf))
                    .await
                    .expect("reply in time")
                    .unwrap();
                assert!(n > 0, "connection closed");
                self.decoder.extend(&buf[..n]);
            }
        }

        async fn handshake(addr: SocketAddr, id: &str, role: Role) -> Self {
            let mut client = Self::connect(addr).await;
            let discovery = Discovery {
                role,
                position: None,
                battery: Some(90),
                command_port: Some(19999),
                status: None,
            };
            client.send(&Envelope::discovery(id, discovery)).await;
            let ack = client.recv().await;
            assert_eq!(ack.packet_type, PacketType::Discovery);
            assert!(matches!(ack.message, Message::Ack(Ack { ok: true, .. })));
            client
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_handshake_registers_device() {
        let (station, addr) = start(test_config()).await;
        let _client = Client::handshake(addr, "R1", Role::Robot).await;

        let device = station.registry.get("R1").await.unwrap();
        assert_eq!(device.role, Role::Robot);
        assert_eq!(device.battery, Some(90));
        assert_eq!(device.command_addr(), Some("127.0.0.1:19999".parse().unwrap()));
        assert_eq!(station.sessions.connected_devices().await, vec!["R1".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let (station, addr) = start(test_config()).await;
        let mut client = Client::handshake(addr, "D1", Role::Drone).await;

        client.stream.write_all(b"{this is not json}\n").await.unwrap();
        let heartbeat = Envelope::message("D1", Message::Heartbeat(Heartbeat::new(Some(42), None, None)));
        client.send(&heartbeat).await;

        let station = station.clone();
        eventually(|| {
            let station = station.clone();
            async move { station.registry.get("D1").await.unwrap().battery == Some(42) }
        })
        .await;
        assert_eq!(station.sessions.count().await, 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout_drops_connection() {
        let config = ServerConfig {
            handshake_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (station, addr) = start(config).await;
        let mut client = Client::connect(addr).await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.stream.read(&mut buf))
            .await
            .expect("server closes the connection")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(station.registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_device_registered() {
        let (station, addr) = start(test_config()).await;
        let client = Client::handshake(addr, "R1", Role::Robot).await;
        drop(client);

        let watcher = station.clone();
        eventually(|| {
            let station = watcher.clone();
            async move { station.sessions.count().await == 0 }
        })
        .await;
        assert!(station.registry.contains("R1").await);
    }

    #[tokio::test]
    async fn test_issue_report_end_to_end() {
        let (station, addr) = start(test_config()).await;
        let _robot = Client::handshake(addr, "R1", Role::Robot).await;
        let mut drone = Client::handshake(addr, "D1", Role::Drone).await;

        let report = IssueReport {
            issue_type: Some("rust".into()),
            ..Default::default()
        };
        drone.send(&Envelope::message("D1", Message::IssueReport(report))).await;

        let reply = drone.recv().await;
        let task_id = match reply.message {
            Message::Ack(Ack { ok: true, reference: Some(id), .. }) => id,
            other => panic!("unexpected reply {other:?}"),
        };
        let task = station.coordinator.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert!(task.claimed_by.contains("R1"));
    }
}
