//! The plug table: single source of truth for device identity, network
//! location, and state.

use std::net::SocketAddr;
use chrono::{DateTime, Utc};
use shared::protocol::AUTO_NAME_PREFIX;
use shared::types::PlugDescriptor;

/// Room kept beyond the configured plugs for devices discovered at runtime.
const DISCOVERY_MARGIN: usize = 32;

/// One physical or configured plug.
#[derive(Debug, Clone)]
pub struct PlugRecord {
    /// Stable identifier used by the control API
    pub name: String,

    /// Human label, optional
    pub description: String,

    /// MAC address as 12 lowercase hex characters; unique within the table
    pub mac: String,

    /// Last address the plug was observed sending from
    pub endpoint: Option<SocketAddr>,

    /// Set on every valid inbound packet; None means unreachable
    pub last_seen: Option<DateTime<Utc>>,

    /// Last state the plug itself reported
    pub actual: bool,

    /// Last state requested by the operator
    pub commanded: bool,

    /// When set, commanded reverts to off at this time
    pub deadline: Option<DateTime<Utc>>,
}

impl PlugRecord {
    fn new(name: String, mac: String, description: String) -> Self {
        Self {
            name,
            description,
            mac,
            endpoint: None,
            last_seen: None,
            actual: false,
            commanded: false,
            deadline: None,
        }
    }

    /// A plug that has never been heard from cannot be commanded yet.
    pub fn reachable(&self) -> bool {
        self.last_seen.is_some()
    }
}

/// Indexed, growable table of known plugs. Indices are stable for the run:
/// the table only grows, up to a capacity fixed when it is (re)built.
pub struct PlugRegistry {
    plugs: Vec<PlugRecord>,
    capacity: usize,
}

impl PlugRegistry {
    /// Build the table from configuration, in descriptor order.
    /// Capacity is the configured count plus a margin for discovered devices.
    pub fn from_config(descriptors: &[PlugDescriptor]) -> Self {
        let plugs = descriptors
            .iter()
            .map(|d| {
                PlugRecord::new(
                    d.name.clone(),
                    d.address.to_lowercase(),
                    d.description.clone(),
                )
            })
            .collect::<Vec<_>>();
        let capacity = plugs.len() + DISCOVERY_MARGIN;
        Self { plugs, capacity }
    }

    pub fn count(&self) -> usize {
        self.plugs.len()
    }

    pub fn get(&self, index: usize) -> Option<&PlugRecord> {
        self.plugs.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut PlugRecord> {
        self.plugs.get_mut(index)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlugRecord> {
        self.plugs.iter_mut()
    }

    /// Out-of-range indices read as empty/default values; callers that need
    /// to distinguish should use get().
    pub fn name(&self, index: usize) -> &str {
        self.plugs.get(index).map_or("", |p| p.name.as_str())
    }

    pub fn commanded(&self, index: usize) -> bool {
        self.plugs.get(index).is_some_and(|p| p.commanded)
    }

    pub fn actual(&self, index: usize) -> bool {
        self.plugs.get(index).is_some_and(|p| p.actual)
    }

    pub fn deadline(&self, index: usize) -> Option<DateTime<Utc>> {
        self.plugs.get(index).and_then(|p| p.deadline)
    }

    /// Why the plug's reported state cannot be trusted, or None if healthy.
    pub fn failure(&self, index: usize) -> Option<&'static str> {
        match self.plugs.get(index) {
            Some(p) if !p.reachable() => Some("silent"),
            _ => None,
        }
    }

    pub fn find_by_mac(&self, mac: &str) -> Option<usize> {
        self.plugs.iter().position(|p| p.mac == mac)
    }

    pub fn is_full(&self) -> bool {
        self.plugs.len() >= self.capacity
    }

    /// Track a device seen on the network but absent from configuration.
    /// Returns the new index, or None once capacity is exhausted.
    pub fn register_discovered(&mut self, mac: &str) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let index = self.plugs.len();
        self.plugs.push(PlugRecord::new(
            format!("{}{}", AUTO_NAME_PREFIX, index),
            mac.to_string(),
            "autogenerated".to_string(),
        ));
        Some(index)
    }

    /// Export every record with both a name and a MAC in the configuration
    /// descriptor shape, so auto-discovered devices can be persisted.
    pub fn live_config(&self) -> Vec<PlugDescriptor> {
        self.plugs
            .iter()
            .filter(|p| !p.name.is_empty() && !p.mac.is_empty())
            .map(|p| PlugDescriptor {
                name: p.name.clone(),
                address: p.mac.clone(),
                description: p.description.clone(),
            })
            .collect()
    }

    /// Clear and rebuild the whole table from configuration, discarding any
    /// discovered-but-unconfigured entries.
    pub fn refresh(&mut self, descriptors: &[PlugDescriptor]) {
        *self = Self::from_config(descriptors);
    }
}
