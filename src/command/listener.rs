//! Command port: the base station opens one short connection per command

use super::executor::CommandExecutor;
use fleet_shared::codec::FrameDecoder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

/// Accept command connections forever
pub async fn serve(listener: TcpListener, executor: Arc<CommandExecutor>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let executor = executor.clone();
                tokio::spawn(async move {
                    read_commands(stream, addr, executor).await;
                });
            }
            Err(e) => {
                warn!(error = %e, "command accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_commands(mut stream: TcpStream, addr: SocketAddr, executor: Arc<CommandExecutor>) {
    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];

    loop {
        while let Some(result) = decoder.decode_next() {
            match result {
                Ok(envelope) => {
                    debug!(%addr, message_type = %envelope.message_type(), "command received");
                    executor.handle(&envelope).await;
                }
                Err(e) => warn!(%addr, error = %e, "malformed command dropped"),
            }
        }

        match stream.read(&mut read_buf).await {
            Ok(0) => return,
            Ok(n) => decoder.extend(&read_buf[..n]),
            Err(e) => {
                warn!(%addr, error = %e, "command read error");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceState;
    use fleet_shared::{codec, Directive, DirectiveKind, Envelope, Message, Position, Role, BASE_STATION_ID};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_command_over_tcp_is_acknowledged() {
        let (tx, mut rx) = mpsc::channel(4);
        let state = Arc::new(DeviceState::new(Role::Drone, Position::default(), 90));
        let executor = Arc::new(CommandExecutor::new("D1".into(), state.clone(), tx, 10.0));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, executor));

        let engage = Envelope::message(
            BASE_STATION_ID,
            Message::Directive(Directive {
                command: DirectiveKind::Engage,
                params: None,
            }),
        );
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"garbage\n").await.unwrap();
        stream.write_all(&codec::encode(&engage).unwrap()).await.unwrap();
        stream.shutdown().await.unwrap();

        let ack = rx.recv().await.unwrap();
        assert_eq!(ack.sender_id, "D1");
        assert!(matches!(ack.message, Message::Ack(ref a) if a.ok));
        assert_eq!(state.snapshot().await.status, "ENGAGED");
    }
}
