use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One configured plug.
/// This is the canonical descriptor shape used by the configuration file,
/// the live-configuration export, and the setup tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlugDescriptor {
    /// Stable identifier used by the control API, e.g. "lamp"
    pub name: String,

    /// Device MAC address as 12 lowercase hex characters
    pub address: String,

    /// Human label, optional
    #[serde(default)]
    pub description: String,
}

/// Per-plug status as reported to the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlugStatus {
    /// Plug name
    pub name: String,

    /// "on"/"off", or the failure reason (e.g. "silent") when the plug
    /// cannot be trusted to report a real state
    pub state: String,

    /// Last state requested by the operator
    pub command: String,

    /// End of the current pulse, if one is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulse: Option<DateTime<Utc>>,
}
