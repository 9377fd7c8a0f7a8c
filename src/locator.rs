//! Protocol client lookup in the host registry.
//!
//! The host keeps integration data in two places whose shape has moved
//! between host versions: per config entry (`runtime_data`) and in a
//! keyed data area per integration domain. [`ClientLocator`] probes both
//! with an ordered list of strategies and takes the first client found.

use std::sync::Arc;

use thiserror::Error;

use crate::client::SharedClient;

/// Capability name under which adapters expose their client.
pub const CLIENT_CAPABILITY: &str = "matter_client";

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("no {protocol} client found in the host registry")]
    NotFound { protocol: String },
}

/// An adapter failed while being probed.
#[derive(Debug, Error)]
#[error("capability probe failed: {0}")]
pub struct ProbeError(pub String);

/// Something the host stores on an integration's behalf that may expose
/// named capabilities.
pub trait Adapter: Send + Sync {
    fn capability(&self, name: &str) -> Result<Option<SharedClient>, ProbeError>;
}

/// A dynamically shaped registry value.
#[derive(Clone)]
pub enum Slot {
    Adapter(Arc<dyn Adapter>),
    /// Keyed sub-collection in insertion order.
    Table(Vec<(String, Slot)>),
}

impl Slot {
    pub fn get(&self, key: &str) -> Option<&Slot> {
        match self {
            Slot::Table(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            Slot::Adapter(_) => None,
        }
    }

    /// Extract a client if this slot exposes one. A failing adapter counts
    /// as "no client here".
    pub fn probe(&self, capability: &str) -> Option<SharedClient> {
        match self {
            Slot::Adapter(adapter) => match adapter.capability(capability) {
                Ok(found) => found,
                Err(e) => {
                    tracing::debug!("Skipping adapter: {}", e);
                    None
                }
            },
            Slot::Table(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    SetupInProgress,
    Loaded,
    SetupError,
}

/// One host config entry.
#[derive(Clone)]
pub struct ConfigEntry {
    pub entry_id: String,
    pub domain: String,
    pub state: EntryState,
    pub runtime_data: Option<Slot>,
}

/// Read-only view of the host's integration registry.
#[derive(Clone, Default)]
pub struct HostRegistry {
    pub entries: Vec<ConfigEntry>,
    pub data: Vec<(String, Slot)>,
}

impl HostRegistry {
    pub fn entries_for<'a>(&'a self, domain: &'a str) -> impl Iterator<Item = &'a ConfigEntry> + 'a {
        self.entries.iter().filter(move |e| e.domain == domain)
    }

    pub fn data_for(&self, domain: &str) -> Option<&Slot> {
        self.data.iter().find(|(k, _)| k == domain).map(|(_, v)| v)
    }
}

/// One way of digging a client out of the registry.
pub trait LookupStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, registry: &HostRegistry, protocol: &str) -> Option<SharedClient>;
}

/// Loaded config entries for the protocol: `runtime_data` first, then the
/// entry's own slot in the protocol's data table.
pub struct LoadedEntries;

impl LookupStrategy for LoadedEntries {
    fn name(&self) -> &'static str {
        "loaded_entries"
    }

    fn extract(&self, registry: &HostRegistry, protocol: &str) -> Option<SharedClient> {
        for entry in registry.entries_for(protocol) {
            if entry.state != EntryState::Loaded {
                continue;
            }
            if let Some(client) = entry.runtime_data.as_ref().and_then(|s| s.probe(CLIENT_CAPABILITY)) {
                return Some(client);
            }
            let legacy = registry
                .data_for(protocol)
                .and_then(|table| table.get(&entry.entry_id))
                .and_then(|slot| slot.probe(CLIENT_CAPABILITY));
            if legacy.is_some() {
                return legacy;
            }
        }
        None
    }
}

/// Every value in the protocol's data table, ignoring entry state.
pub struct DataScan;

impl LookupStrategy for DataScan {
    fn name(&self) -> &'static str {
        "data_scan"
    }

    fn extract(&self, registry: &HostRegistry, protocol: &str) -> Option<SharedClient> {
        match registry.data_for(protocol)? {
            Slot::Table(entries) => entries.iter().find_map(|(_, slot)| slot.probe(CLIENT_CAPABILITY)),
            _ => None,
        }
    }
}

pub struct ClientLocator {
    strategies: Vec<Box<dyn LookupStrategy>>,
}

impl Default for ClientLocator {
    fn default() -> Self {
        Self::new(vec![Box::new(LoadedEntries), Box::new(DataScan)])
    }
}

impl ClientLocator {
    pub fn new(strategies: Vec<Box<dyn LookupStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn resolve(&self, registry: &HostRegistry, protocol: &str) -> Result<SharedClient, LocatorError> {
        for strategy in &self.strategies {
            if let Some(client) = strategy.extract(registry, protocol) {
                tracing::debug!("Resolved {} client via {}", protocol, strategy.name());
                return Ok(client);
            }
        }
        Err(LocatorError::NotFound { protocol: protocol.to_string() })
    }
}

/// Adapter wrapping a live client, as the Matter integration registers it.
pub struct ClientAdapter {
    client: SharedClient,
}

impl ClientAdapter {
    pub fn new(client: SharedClient) -> Self {
        Self { client }
    }
}

impl Adapter for ClientAdapter {
    fn capability(&self, name: &str) -> Result<Option<SharedClient>, ProbeError> {
        Ok((name == CLIENT_CAPABILITY).then(|| self.client.clone()))
    }
}
