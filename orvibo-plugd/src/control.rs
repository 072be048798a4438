//! The reactor loop that owns the engine, and the command handle through
//! which external layers (HTTP, CLI) reach it.
//!
//! Everything that touches the registry runs on the one task inside run():
//! inbound packets, the periodic tick, control commands, and configuration
//! reloads are serialized by the select loop, so the engine needs no locks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use shared::types::{PlugDescriptor, PlugStatus};
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{self, Config};
use crate::engine::{Clock, PlugEngine};
use crate::transport::Transport;

/// Commands sent to the engine task
pub enum EngineCommand {
    Set {
        name: String,
        state: bool,
        pulse_secs: u32,
        reply: oneshot::Sender<bool>,
    },
    Status(oneshot::Sender<Vec<PlugStatus>>),
    LiveConfig(oneshot::Sender<Vec<PlugDescriptor>>),
    Refresh {
        plugs: Vec<PlugDescriptor>,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to interact with the engine task
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn channel() -> (Self, mpsc::Receiver<EngineCommand>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }

    /// Command one plug by name, or every plug with "all".
    /// Returns whether any plug matched.
    pub async fn set(&self, name: &str, state: bool, pulse_secs: u32) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Set {
                name: name.to_string(),
                state,
                pulse_secs,
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Current status of every plug
    pub async fn status(&self) -> Result<Vec<PlugStatus>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Status(reply)).await?;
        Ok(rx.await?)
    }

    /// Export the live configuration (configured + discovered plugs)
    pub async fn live_config(&self) -> Result<Vec<PlugDescriptor>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineCommand::LiveConfig(reply)).await?;
        Ok(rx.await?)
    }

    /// Rebuild the registry from new configuration
    pub async fn refresh(&self, plugs: Vec<PlugDescriptor>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Refresh { plugs, reply })
            .await?;
        Ok(rx.await?)
    }
}

/// Engine task event loop. SIGHUP reloads the configuration file, SIGUSR1
/// logs the live configuration so discovered plugs can be captured.
pub async fn run<T: Transport, C: Clock>(
    mut engine: PlugEngine<T, C>,
    socket: Arc<UdpSocket>,
    mut commands: mpsc::Receiver<EngineCommand>,
    config_path: PathBuf,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut reload = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut export =
        signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, source)) => engine.on_packet(&buf[..len], source),
                    Err(e) => tracing::error!("UDP receive error: {e}"),
                }
            }

            _ = ticker.tick() => {
                engine.on_tick();
            }

            Some(cmd) = commands.recv() => {
                handle_command(&mut engine, cmd);
            }

            _ = reload.recv() => {
                match Config::load(&config_path) {
                    Ok(config) => {
                        tracing::info!("Reloaded config from {}", config_path.display());
                        engine.refresh(&config.plugs);
                    }
                    Err(e) => {
                        tracing::error!("Config reload failed, keeping current plugs: {e:#}");
                    }
                }
            }

            _ = export.recv() => {
                match config::export_live(&engine.live_config()) {
                    Ok(json) => tracing::info!("live configuration:\n{json}"),
                    Err(e) => tracing::error!("Live configuration export failed: {e}"),
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Engine loop shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn handle_command<T: Transport, C: Clock>(engine: &mut PlugEngine<T, C>, cmd: EngineCommand) {
    match cmd {
        EngineCommand::Set {
            name,
            state,
            pulse_secs,
            reply,
        } => {
            let _ = reply.send(engine.set_named(&name, state, pulse_secs));
        }
        EngineCommand::Status(reply) => {
            let _ = reply.send(engine.status());
        }
        EngineCommand::LiveConfig(reply) => {
            let _ = reply.send(engine.live_config());
        }
        EngineCommand::Refresh { plugs, reply } => {
            engine.refresh(&plugs);
            let _ = reply.send(());
        }
    }
}
