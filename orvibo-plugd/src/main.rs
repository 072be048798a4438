mod codec;
mod config;
mod control;
mod engine;
mod events;
mod registry;
mod transport;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::control::EngineHandle;
use crate::engine::{PlugEngine, SystemClock};
use crate::transport::UdpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("orvibo_plugd=info")),
        )
        .init();

    tracing::info!("Starting orvibo-plugd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_PATH.to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!(
        "Loaded config from {} ({} plugs)",
        config_path,
        config.plugs.len()
    );

    // Open the plug protocol socket. An unusable network stack is fatal.
    let bind: SocketAddr = (Ipv4Addr::UNSPECIFIED, config.network.port).into();
    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("Failed to bind UDP port {}", config.network.port))?;
    socket
        .set_broadcast(true)
        .context("Failed to enable broadcast")?;
    let socket = Arc::new(socket);
    tracing::info!("UDP port {} is now open", config.network.port);

    let broadcast_addr = SocketAddr::from((config.network.broadcast, config.network.port));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let engine = PlugEngine::new(
        &config.plugs,
        UdpTransport::new(socket.clone(), broadcast_addr),
        SystemClock,
        event_tx,
    );

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn the event logger task
    let logger_handle = tokio::spawn(events::log_events(event_rx));

    // Spawn the engine task; _handle is where an HTTP or CLI layer plugs in
    let (_handle, cmd_rx) = EngineHandle::channel();
    let engine_cancel = cancel.clone();
    let engine_socket = socket.clone();
    let engine_path = PathBuf::from(&config_path);
    let engine_handle = tokio::spawn(async move {
        if let Err(e) = control::run(engine, engine_socket, cmd_rx, engine_path, engine_cancel).await
        {
            tracing::error!("Engine loop error: {e}");
        }
    });

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::info!("orvibo-plugd running on {host}");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation and wait for the tasks to drain
    cancel.cancel();
    let _ = tokio::join!(engine_handle, logger_handle);

    tracing::info!("Shutdown complete");
    Ok(())
}
