//! Command-line configuration for the base station

use crate::session::RetryPolicy;
use clap::Parser;
use fleet_shared::timing;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "base-station", version, about = "Fleet base station: device sessions, task assignment and dashboard API")]
pub struct Args {
    /// Address to bind both listeners on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub bind: IpAddr,

    /// Port devices connect to
    #[arg(long, default_value_t = timing::DEVICE_PORT)]
    pub device_port: u16,

    /// Port of the dashboard HTTP API
    #[arg(long, default_value_t = timing::HTTP_PORT)]
    pub http_port: u16,

    /// TOML issue table; the built-in table is used when absent
    #[arg(long)]
    pub issues: Option<PathBuf>,

    /// Seconds a new connection has to send DISCOVERY
    #[arg(long, default_value_t = timing::HANDSHAKE_TIMEOUT_MS / 1000)]
    pub handshake_timeout_secs: u64,

    /// Seconds without traffic before a device is flagged stale
    #[arg(long, default_value_t = timing::HEARTBEAT_TIMEOUT_MS / 1000)]
    pub heartbeat_timeout_secs: u64,

    /// Delivery attempts per command
    #[arg(long, default_value_t = timing::SEND_MAX_ATTEMPTS)]
    pub send_attempts: u32,

    /// Milliseconds between delivery attempts
    #[arg(long, default_value_t = timing::SEND_RETRY_BACKOFF_MS)]
    pub send_backoff_ms: u64,

    /// Connect + write timeout per delivery attempt, in milliseconds
    #[arg(long, default_value_t = timing::SEND_TIMEOUT_MS)]
    pub send_timeout_ms: u64,

    /// Entries kept in the command and network logs
    #[arg(long, default_value_t = 500)]
    pub log_capacity: usize,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Resolved runtime settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub device_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub heartbeat_timeout: Duration,
    /// How often the liveness monitor sweeps
    pub liveness_interval: Duration,
    pub retry: RetryPolicy,
    pub send_timeout: Duration,
    pub log_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let bind = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            device_addr: SocketAddr::new(bind, timing::DEVICE_PORT),
            http_addr: SocketAddr::new(bind, timing::HTTP_PORT),
            handshake_timeout: Duration::from_millis(timing::HANDSHAKE_TIMEOUT_MS),
            heartbeat_timeout: Duration::from_millis(timing::HEARTBEAT_TIMEOUT_MS),
            liveness_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_millis(timing::SEND_TIMEOUT_MS),
            log_capacity: 500,
        }
    }
}

impl From<&Args> for ServerConfig {
    fn from(args: &Args) -> Self {
        Self {
            device_addr: SocketAddr::new(args.bind, args.device_port),
            http_addr: SocketAddr::new(args.bind, args.http_port),
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
            retry: RetryPolicy {
                attempts: args.send_attempts.max(1),
                backoff: Duration::from_millis(args.send_backoff_ms),
            },
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            log_capacity: args.log_capacity,
            ..Default::default()
        }
    }
}
