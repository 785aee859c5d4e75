mod command;
mod connection;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use command::CommandExecutor;
use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use fleet_shared::{timing, Envelope, IssueReport, Message, Position, Role};
use state::DeviceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fleet-agent", version, about = "Simulated drone or robot for the fleet base station")]
struct Args {
    /// DRONE or ROBOT
    #[arg(long, default_value = "ROBOT")]
    role: Role,

    /// Device id, unique across the fleet
    #[arg(long)]
    id: String,

    /// Base station device port
    #[arg(long, default_value_t = format!("127.0.0.1:{}", timing::DEVICE_PORT))]
    server: String,

    /// Port to accept base-station commands on
    #[arg(long, default_value_t = timing::COMMAND_PORT)]
    command_port: u16,

    /// Starting (home) position as x,y,z
    #[arg(long, value_parser = parse_position, default_value = "0,0,0")]
    home: Position,

    #[arg(long, default_value_t = 100)]
    battery: u8,

    /// Simulated travel speed in units per second
    #[arg(long, default_value_t = 20.0)]
    speed: f64,

    /// Issue types (or QR payloads with --qr) a drone reports, in order
    #[arg(long = "report", value_delimiter = ',')]
    reports: Vec<String>,

    /// Treat --report values as QR payloads
    #[arg(long)]
    qr: bool,

    /// Seconds between issue reports
    #[arg(long, default_value_t = 15)]
    report_interval_secs: u64,
}

fn parse_position(s: &str) -> Result<Position, String> {
    let parts: Vec<f64> = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| format!("{p:?}: {e}")))
        .collect::<Result<_, _>>()?;
    match parts.as_slice() {
        [x, y] => Ok(Position::new(*x, *y, 0.0)),
        [x, y, z] => Ok(Position::new(*x, *y, *z)),
        _ => Err(format!("expected x,y or x,y,z, got {s:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    info!(device_id = %args.id, role = %args.role, server = %args.server, "agent starting");

    let state = Arc::new(DeviceState::new(args.role, args.home, args.battery));
    let config = ConnectionConfig {
        device_id: args.id.clone(),
        role: args.role,
        server: args.server.clone(),
        command_port: args.command_port,
        ..Default::default()
    };
    let mut conn = ConnectionManager::new(config, state.clone());

    let command_listener = TcpListener::bind(("0.0.0.0", args.command_port))
        .await
        .with_context(|| format!("failed to bind command port {}", args.command_port))?;
    let executor = Arc::new(CommandExecutor::new(
        args.id.clone(),
        state.clone(),
        conn.get_sender(),
        args.speed,
    ));
    tokio::spawn(command::serve(command_listener, executor));
    info!(port = args.command_port, "command listener ready");

    if args.role == Role::Drone && !args.reports.is_empty() {
        let sender = conn.get_sender();
        let interval = Duration::from_secs(args.report_interval_secs.max(1));
        tokio::spawn(report_issues(args.id.clone(), state.clone(), sender, args.reports, args.qr, interval));
    }

    // Main event loop
    loop {
        match conn.recv().await {
            Some(ConnectionEvent::Connected) => {
                info!("connected to base station");
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!(%reason, "disconnected");
            }
            Some(ConnectionEvent::ConnectionFailed { reason }) => {
                error!(%reason, "connection failed");
            }
            Some(ConnectionEvent::Received(envelope)) => match envelope.message {
                Message::Ack(ack) if ack.ok => {
                    info!(message = %ack.message, reference = ?ack.reference, "base station ACK");
                }
                Message::Ack(ack) => {
                    warn!(message = %ack.message, "base station rejected a message");
                }
                other => debug!(message_type = %other.message_type(), "unhandled message from base station"),
            },
            None => {
                error!("connection manager closed");
                break;
            }
        }
    }

    Ok(())
}

/// Report the configured issues one after another, then stop
async fn report_issues(
    device_id: String,
    state: Arc<DeviceState>,
    sender: mpsc::Sender<Envelope>,
    reports: Vec<String>,
    qr: bool,
    interval: Duration,
) {
    for value in reports {
        tokio::time::sleep(interval).await;

        let position = state.snapshot().await.position;
        let report = if qr {
            IssueReport {
                qr_code: Some(value.clone()),
                coordinates: Some(position),
                ..Default::default()
            }
        } else {
            IssueReport {
                issue_type: Some(value.clone()),
                coordinates: Some(position),
                ..Default::default()
            }
        };

        info!(issue = %value, "reporting issue");
        if sender
            .send(Envelope::message(&device_id, Message::IssueReport(report)))
            .await
            .is_err()
        {
            warn!("session closed, stopping issue reports");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("1,2").unwrap(), Position::new(1.0, 2.0, 0.0));
        assert_eq!(parse_position("1.5, 2, 3").unwrap(), Position::new(1.5, 2.0, 3.0));
        assert!(parse_position("1").is_err());
        assert!(parse_position("a,b").is_err());
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from([
            "fleet-agent",
            "--role",
            "drone",
            "--id",
            "D1",
            "--report",
            "rust,tilted_antenna",
        ]);
        assert_eq!(args.role, Role::Drone);
        assert_eq!(args.reports, vec!["rust".to_string(), "tilted_antenna".to_string()]);
        assert_eq!(args.command_port, 9999);
    }
}
