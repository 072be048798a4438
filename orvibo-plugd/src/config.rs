use std::net::Ipv4Addr;
use std::path::Path;
use anyhow::{Context, Result};
use serde::Deserialize;
use shared::protocol::PLUG_PORT;
use shared::types::PlugDescriptor;

pub const DEFAULT_PATH: &str = "/etc/orvibo/plugd.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    /// Configured plugs, in order. A file without any [[plugs]] section is
    /// valid: no plugs yet, discovery will find them.
    #[serde(default)]
    pub plugs: Vec<PlugDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_broadcast")]
    pub broadcast: Ipv4Addr,
}

fn default_port() -> u16 {
    PLUG_PORT
}

fn default_broadcast() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            broadcast: default_broadcast(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

/// Render a plug list as the JSON document the configuration-persistence
/// service expects, so auto-discovered plugs can be saved.
pub fn export_live(plugs: &[PlugDescriptor]) -> Result<String> {
    let document = serde_json::json!({ "orvibo": { "plugs": plugs } });
    serde_json::to_string_pretty(&document).context("Failed to serialize live configuration")
}
