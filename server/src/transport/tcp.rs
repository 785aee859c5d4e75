//! TCP command link: one short-lived connection per delivery

use crate::transport::traits::CommandLink;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub struct TcpCommandLink {
    /// Bound on connect + write for one attempt
    timeout: Duration,
}

impl TcpCommandLink {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandLink for TcpCommandLink {
    async fn deliver(&self, addr: SocketAddr, frame: Bytes) -> Result<()> {
        let attempt = async {
            let mut stream = TcpStream::connect(addr)
                .await
                .with_context(|| format!("connect to {addr}"))?;
            stream.write_all(&frame).await.context("write frame")?;
            stream.shutdown().await.context("close stream")?;
            Ok::<_, anyhow::Error>(())
        };

        timeout(self.timeout, attempt)
            .await
            .map_err(|_| anyhow!("timed out after {:?} delivering to {addr}", self.timeout))?
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_delivers_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let reader = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let link = TcpCommandLink::new(Duration::from_secs(2));
        link.deliver(addr, Bytes::from_static(b"{\"hello\":1}\n"))
            .await
            .expect("delivery");

        assert_eq!(reader.await.unwrap(), b"{\"hello\":1}\n");
        assert_eq!(link.name(), "TCP");
    }

    #[tokio::test]
    async fn test_refused_connection_is_an_error() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let link = TcpCommandLink::new(Duration::from_secs(2));
        assert!(link.deliver(addr, Bytes::from_static(b"x\n")).await.is_err());
    }
}
