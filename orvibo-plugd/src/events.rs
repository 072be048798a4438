//! Device events, published over a channel for an external consumer.
//!
//! The daemon's own consumer just logs them; a fleet-level event service
//! would subscribe to the same channel.

use std::fmt;
use shared::protocol::state_name;
use tokio::sync::mpsc;

/// Everything notable that happens to a plug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlugEvent {
    /// A device absent from configuration appeared on the network
    Added { name: String, mac: String },
    /// A previously silent device is answering again
    Detected { name: String, mac: String },
    /// A device missed three discovery cycles in a row
    Silent { name: String, mac: String },
    /// The device reported a state different from the last report
    Changed { name: String, from: bool, to: bool },
    /// The operator requested a state; pulse_secs 0 means no pulse
    Set {
        name: String,
        state: bool,
        pulse_secs: u32,
    },
    /// A pulse expired and the command reverted to off
    Reset { name: String },
    /// Reconciliation re-sent a command toward the target state
    Retry { name: String, state: bool },
}

impl PlugEvent {
    pub fn name(&self) -> &str {
        match self {
            PlugEvent::Added { name, .. }
            | PlugEvent::Detected { name, .. }
            | PlugEvent::Silent { name, .. }
            | PlugEvent::Changed { name, .. }
            | PlugEvent::Set { name, .. }
            | PlugEvent::Reset { name }
            | PlugEvent::Retry { name, .. } => name,
        }
    }
}

impl fmt::Display for PlugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlugEvent::Added { name, mac } => {
                write!(f, "{name} ADDED MAC ADDRESS {mac}")
            }
            PlugEvent::Detected { name, mac } => {
                write!(f, "{name} DETECTED MAC ADDRESS {mac}")
            }
            PlugEvent::Silent { name, mac } => {
                write!(f, "{name} SILENT MAC ADDRESS {mac}")
            }
            PlugEvent::Changed { name, from, to } => {
                write!(
                    f,
                    "{name} CHANGED FROM {} TO {}",
                    state_name(*from),
                    state_name(*to)
                )
            }
            PlugEvent::Set {
                name,
                state,
                pulse_secs: 0,
            } => write!(f, "{name} SET {}", state_name(*state)),
            PlugEvent::Set {
                name,
                state,
                pulse_secs,
            } => write!(f, "{name} SET {} FOR {pulse_secs} SECONDS", state_name(*state)),
            PlugEvent::Reset { name } => write!(f, "{name} RESET END OF PULSE"),
            PlugEvent::Retry { name, state } => {
                write!(f, "{name} RETRY {}", state_name(*state))
            }
        }
    }
}

/// Log every event. Stands in for the external event-publishing service.
pub async fn log_events(mut rx: mpsc::UnboundedReceiver<PlugEvent>) {
    while let Some(event) = rx.recv().await {
        tracing::info!(target: "device", "{event}");
    }
}
