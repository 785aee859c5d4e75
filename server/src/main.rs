mod api;
mod command;
mod config;
mod coordinator;
mod error;
mod handler;
mod issues;
mod packets;
mod registry;
mod session;
mod station;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Args, ServerConfig};
use issues::IssueResolver;
use session::LivenessMonitor;
use station::BaseStation;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use transport::TcpCommandLink;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    let config = ServerConfig::from(&args);
    let resolver = match &args.issues {
        Some(path) => IssueResolver::load(path)?,
        None => IssueResolver::builtin(),
    };
    for (issue_type, location) in resolver.entries() {
        info!(
            issue_type,
            coordinates = %location.coordinates,
            robot_count = location.robot_count,
            "issue type loaded"
        );
    }

    let link = Arc::new(TcpCommandLink::new(config.send_timeout));
    let (station, worker) = BaseStation::new(config.clone(), resolver, link);

    let device_listener = TcpListener::bind(config.device_addr)
        .await
        .with_context(|| format!("failed to bind device port {}", config.device_addr))?;
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP port {}", config.http_addr))?;

    info!(addr = %config.device_addr, "device listener ready");
    info!(addr = %config.http_addr, "dashboard API ready");

    tokio::spawn(worker.run());

    let monitor = LivenessMonitor::new(station.registry.clone(), config.liveness_interval);
    tokio::spawn(async move { monitor.run().await });

    tokio::spawn(session::serve(device_listener, station.clone()));

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    };

    if let Err(e) = axum::serve(http_listener, api::router(station))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "HTTP server failed");
        return Err(e.into());
    }

    Ok(())
}
