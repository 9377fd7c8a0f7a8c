//! Service configuration.
//!
//! Read from a YAML file, then overridden from the environment:
//!
//! ```yaml
//! entry:
//!   node_id: 5
//!   endpoint_id: 1
//! matter:
//!   ws_url: ws://localhost:5580/ws
//!   request_timeout_secs: 30
//!   reconnect_interval_secs: 10
//! http_port: 8125
//! ```

use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;

use crate::client::{EndpointId, NodeId};
use crate::integrations::matter::MatterConfig;

pub const DEFAULT_CONFIG_PATH: &str = "haier_bridge.yaml";
pub const DEFAULT_HTTP_PORT: u16 = 8125;

/// The device a bridge entry is bound to.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BridgeEntry {
    pub node_id: NodeId,
    #[serde(default = "default_endpoint_id")]
    pub endpoint_id: EndpointId,
}

fn default_endpoint_id() -> EndpointId {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub entry: Option<BridgeEntry>,
    pub matter: MatterConfig,
    pub http_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            entry: None,
            matter: MatterConfig::default(),
            http_port: DEFAULT_HTTP_PORT,
        }
    }
}

impl Config {
    /// Load `path` if it exists, otherwise start from defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(url) = lookup("MATTER_WS_URL") {
            self.matter.ws_url = url;
        }
        if let Some(port) = lookup("HAIER_BRIDGE_HTTP_PORT") {
            self.http_port = port
                .parse()
                .with_context(|| format!("invalid HAIER_BRIDGE_HTTP_PORT {:?}", port))?;
        }
        if let Some(node) = lookup("HAIER_BRIDGE_NODE_ID") {
            let node_id = node
                .parse()
                .with_context(|| format!("invalid HAIER_BRIDGE_NODE_ID {:?}", node))?;
            let endpoint_id = self.entry.as_ref().map(|e| e.endpoint_id).unwrap_or(1);
            self.entry = Some(BridgeEntry { node_id, endpoint_id });
        }
        if let Some(endpoint) = lookup("HAIER_BRIDGE_ENDPOINT_ID") {
            let endpoint_id = endpoint
                .parse()
                .with_context(|| format!("invalid HAIER_BRIDGE_ENDPOINT_ID {:?}", endpoint))?;
            if let Some(entry) = self.entry.as_mut() {
                entry.endpoint_id = endpoint_id;
            }
        }
        Ok(())
    }

    /// The configured device, required to set up any entity.
    pub fn entry(&self) -> anyhow::Result<&BridgeEntry> {
        self.entry
            .as_ref()
            .context("no device configured: set entry.node_id or HAIER_BRIDGE_NODE_ID")
    }
}
