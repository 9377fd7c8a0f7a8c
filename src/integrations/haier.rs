//! Haier vendor attributes over Matter
//!
//! Haier heat pumps expose their operating state, mode and compressor
//! frequencies in a manufacturer cluster. This module turns those four
//! attributes into entities:
//! - `select` platform: state (OFF/HEAT/COOL) and mode (ECO/QUIET/TURBO)
//! - `sensor` platform: compressor frequency and its target, in Hz
//!
//! Each platform setup resolves the Matter client from the host registry
//! on its own. Without a client the platform creates nothing. Entities go
//! `unavailable` while the Matter server is unreachable and are re-read
//! once it is back.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;

use crate::api::AppState;
use crate::bridge::{
    AttributeBridge, AttributeKey, BridgeStatus, BridgeValue, ChangeHook, DeviceAddress,
    WriteOutcome,
};
use crate::client::{AttributeId, ClusterId, NodeDescriptor, SharedClient};
use crate::codemap::{CodeMap, CodeMapError};
use crate::config::BridgeEntry;
use crate::integrations::matter::ServerStatus;
use crate::locator::{ClientLocator, HostRegistry, LocatorError};

pub const DOMAIN: &str = "haier_matter";
/// Integration domain that owns the Matter client.
pub const MATTER_DOMAIN: &str = "matter";

pub const VENDOR_CLUSTER_ID: ClusterId = 0xFC01;
pub const ATTR_STATE_ID: AttributeId = 0x0001;
pub const ATTR_MODE_ID: AttributeId = 0x0002;
pub const ATTR_COMP_HZ_ID: AttributeId = 0x0003;
pub const ATTR_COMP_TARGET_ID: AttributeId = 0x0004;

pub const STATE_CODES: [(u64, &str); 3] = [(0, "OFF"), (1, "HEAT"), (2, "COOL")];
pub const MODE_CODES: [(u64, &str); 3] = [(0, "ECO"), (1, "QUIET"), (2, "TURBO")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Select,
    Sensor,
}

impl Platform {
    pub fn domain(&self) -> &'static str {
        match self {
            Platform::Select => "select",
            Platform::Sensor => "sensor",
        }
    }
}

/// Static description of one entity.
struct EntityDescription {
    name: &'static str,
    attribute_id: AttributeId,
    codes: Option<&'static [(u64, &'static str)]>,
}

const SELECTS: [EntityDescription; 2] = [
    EntityDescription { name: "Haier State", attribute_id: ATTR_STATE_ID, codes: Some(&STATE_CODES) },
    EntityDescription { name: "Haier Mode", attribute_id: ATTR_MODE_ID, codes: Some(&MODE_CODES) },
];

const SENSORS: [EntityDescription; 2] = [
    EntityDescription { name: "Compressor Frequency", attribute_id: ATTR_COMP_HZ_ID, codes: None },
    EntityDescription { name: "Compressor Target Frequency", attribute_id: ATTR_COMP_TARGET_ID, codes: None },
];

/// A live entity backed by a bridge.
pub struct HaierEntity {
    pub entity_id: String,
    pub unique_id: String,
    pub platform: Platform,
    pub bridge: Arc<AttributeBridge>,
    attributes: serde_json::Map<String, serde_json::Value>,
}

/// Serializable summary for the API.
#[derive(Debug, Clone, Serialize)]
pub struct EntitySummary {
    pub entity_id: String,
    pub unique_id: String,
    pub platform: Platform,
    pub name: String,
    pub address: DeviceAddress,
    pub key: AttributeKey,
    pub state: BridgeValue,
    pub options: Vec<String>,
}

pub struct HaierIntegration {
    app: Arc<AppState>,
    locator: ClientLocator,
    entities: DashMap<String, HaierEntity>,
}

impl HaierIntegration {
    pub fn new(app: Arc<AppState>) -> Self {
        Self {
            app,
            locator: ClientLocator::default(),
            entities: DashMap::new(),
        }
    }

    /// Resolve the Matter client. Not cached: the registry may change
    /// between calls.
    pub fn resolve_client(&self, registry: &HostRegistry) -> Result<SharedClient, LocatorError> {
        self.locator.resolve(registry, MATTER_DOMAIN)
    }

    /// Set up both platforms for a config entry. Returns the number of
    /// entities created.
    pub async fn setup_entry(&self, registry: &HostRegistry, entry: &BridgeEntry) -> usize {
        let mut created = 0;
        for platform in [Platform::Select, Platform::Sensor] {
            match self.setup_platform(platform, registry, entry).await {
                Ok(n) => created += n,
                Err(e) => tracing::error!("Haier bridge: {} platform setup failed: {}", platform.domain(), e),
            }
        }
        created
    }

    /// Create, publish and activate the entities of one platform.
    pub async fn setup_platform(
        &self,
        platform: Platform,
        registry: &HostRegistry,
        entry: &BridgeEntry,
    ) -> Result<usize, CodeMapError> {
        let client = match self.resolve_client(registry) {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("Haier bridge: Matter client not found. Is the Matter integration running? ({})", e);
                return Ok(0);
            }
        };

        let descriptions = match platform {
            Platform::Select => &SELECTS,
            Platform::Sensor => &SENSORS,
        };
        let address = DeviceAddress { node_id: entry.node_id, endpoint_id: entry.endpoint_id };

        let mut bridges = Vec::with_capacity(descriptions.len());
        for desc in descriptions {
            let codes = desc.codes.map(|pairs| CodeMap::new(pairs.iter().copied())).transpose()?;
            let entity = self.build_entity(platform, client.clone(), address, desc, codes.map(Arc::new));
            bridges.push(entity.bridge.clone());
            tracing::info!("Adding {} ({})", entity.entity_id, entity.unique_id);
            if let Some(previous) = self.entities.insert(entity.entity_id.clone(), entity) {
                tracing::debug!("Replacing {}", previous.entity_id);
                previous.bridge.deactivate();
            }
        }

        for bridge in &bridges {
            bridge.activate().await;
        }
        Ok(bridges.len())
    }

    fn build_entity(
        &self,
        platform: Platform,
        client: SharedClient,
        address: DeviceAddress,
        desc: &EntityDescription,
        codes: Option<Arc<CodeMap>>,
    ) -> HaierEntity {
        let unique_id = format!(
            "haier_{}_{}_{}_{}",
            platform.domain(),
            address.node_id,
            address.endpoint_id,
            desc.attribute_id
        );
        let entity_id = format!("{}.{}", platform.domain(), slugify(desc.name));

        let mut attrs = serde_json::Map::new();
        attrs.insert("friendly_name".into(), json!(desc.name));
        attrs.insert("unique_id".into(), json!(unique_id));
        attrs.insert("integration".into(), json!(DOMAIN));
        attrs.insert("node_id".into(), json!(address.node_id));
        attrs.insert("endpoint_id".into(), json!(address.endpoint_id));
        match &codes {
            Some(codes) => {
                attrs.insert("options".into(), json!(codes.options()));
            }
            None => {
                attrs.insert("unit_of_measurement".into(), json!("Hz"));
                attrs.insert("state_class".into(), json!("measurement"));
            }
        }

        // Publish before activation so the entity exists while unknown
        self.app
            .state_machine
            .set(entity_id.clone(), BridgeValue::Unknown.as_state(), attrs.clone());

        let app = self.app.clone();
        let hook_entity_id = entity_id.clone();
        let hook_attrs = attrs.clone();
        let hook: ChangeHook = Arc::new(move |value: &BridgeValue| {
            app.state_machine.set(hook_entity_id.clone(), value.as_state(), hook_attrs.clone());
        });

        let key = AttributeKey { cluster_id: VENDOR_CLUSTER_ID, attribute_id: desc.attribute_id };
        let bridge = AttributeBridge::new(client, address, key, desc.name, codes, Some(hook));

        HaierEntity {
            entity_id,
            unique_id,
            platform,
            bridge: Arc::new(bridge),
            attributes: attrs,
        }
    }

    pub fn bridge(&self, entity_id: &str) -> Option<Arc<AttributeBridge>> {
        self.entities.get(entity_id).map(|e| e.bridge.clone())
    }

    /// Select an option on a select entity. `None` if no such entity.
    pub async fn select_option(&self, entity_id: &str, option: &str) -> Option<WriteOutcome> {
        let bridge = self.bridge(entity_id)?;
        Some(bridge.write(option).await)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn summaries(&self) -> Vec<EntitySummary> {
        let mut list: Vec<EntitySummary> = self
            .entities
            .iter()
            .map(|e| EntitySummary {
                entity_id: e.entity_id.clone(),
                unique_id: e.unique_id.clone(),
                platform: e.platform,
                name: e.bridge.name().to_string(),
                address: e.bridge.address(),
                key: e.bridge.key(),
                state: e.bridge.current_value(),
                options: e.bridge.options(),
            })
            .collect();
        list.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        list
    }

    /// Tear down every entity: unsubscribe and mark unavailable.
    pub fn unload(&self) {
        let ids: Vec<String> = self.entities.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entity)) = self.entities.remove(&id) {
                entity.bridge.deactivate();
                self.publish_unavailable(&entity.entity_id, &entity.attributes);
            }
        }
        tracing::info!("Haier bridge unloaded");
    }

    /// Mark every entity unavailable without tearing it down. Bridges keep
    /// their subscriptions for when the server returns.
    pub fn mark_unavailable(&self) {
        for entity in self.entities.iter() {
            self.publish_unavailable(&entity.entity_id, &entity.attributes);
        }
    }

    /// Re-read every bridge and republish its value.
    pub async fn resync(&self) {
        let entities: Vec<(String, Arc<AttributeBridge>, serde_json::Map<String, serde_json::Value>)> = self
            .entities
            .iter()
            .map(|e| (e.entity_id.clone(), e.bridge.clone(), e.attributes.clone()))
            .collect();

        for (entity_id, bridge, attrs) in entities {
            bridge.refresh().await;
            // A failed read leaves the last known value in place
            if bridge.status() != BridgeStatus::Deactivated {
                self.app
                    .state_machine
                    .set(entity_id, bridge.current_value().as_state(), attrs);
            }
        }
    }

    /// Track the Matter connection: entities go unavailable when it drops
    /// and are resynced when it comes back. `online` is whether the server
    /// was connected when the entities were set up. Returns when the
    /// sender closes.
    pub async fn follow_connection(&self, mut status: watch::Receiver<ServerStatus>, mut online: bool) {
        loop {
            let current = *status.borrow_and_update();
            match current {
                ServerStatus::Connected if !online => {
                    tracing::info!("Matter server available, resyncing {} entities", self.entity_count());
                    self.resync().await;
                    online = true;
                }
                ServerStatus::Disconnected if online => {
                    tracing::warn!("Matter server unavailable, marking {} entities unavailable", self.entity_count());
                    self.mark_unavailable();
                    online = false;
                }
                // Set up while the server was already down
                ServerStatus::Disconnected => self.mark_unavailable(),
                _ => {}
            }
            if status.changed().await.is_err() {
                break;
            }
        }
    }

    fn publish_unavailable(&self, entity_id: &str, attributes: &serde_json::Map<String, serde_json::Value>) {
        let mut attrs = attributes.clone();
        attrs.insert("available".into(), json!(false));
        self.app
            .state_machine
            .set(entity_id.to_string(), "unavailable".to_string(), attrs);
    }
}

/// Device picker entries: `(node_id, "<name> (ID: <node_id>)")`.
pub fn device_choices(nodes: &[NodeDescriptor]) -> Vec<(u64, String)> {
    nodes
        .iter()
        .map(|n| (n.node_id, format!("{} (ID: {})", n.display_name(), n.node_id)))
        .collect()
}

/// Convert a display name to an entity-safe slug.
fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

// ── Tests ───────────────────────────────────────────────────
