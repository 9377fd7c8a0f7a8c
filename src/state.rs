use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// HA-compatible entity state object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub last_changed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_reported: DateTime<Utc>,
    pub context: Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
        }
    }
}

/// Fired when an entity's state or attributes change
#[derive(Debug, Clone, Serialize)]
pub struct StateChangedEvent {
    pub entity_id: String,
    pub old_state: Option<EntityState>,
    pub new_state: EntityState,
}

/// Entity state store with change notifications.
pub struct StateMachine {
    states: Arc<DashMap<String, EntityState>>,
    event_tx: broadcast::Sender<StateChangedEvent>,
}

impl StateMachine {
    pub fn new(channel_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(channel_capacity);
        Self {
            states: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    /// Get all entity states
    pub fn get_all(&self) -> Vec<EntityState> {
        let mut all: Vec<EntityState> = self
            .states
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        all
    }

    /// Get a single entity state
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|entry| entry.value().clone())
    }

    /// Set entity state and return the stored value.
    ///
    /// A write that changes neither state nor attributes only bumps
    /// `last_reported` and fires no event.
    pub fn set(&self, entity_id: String, state: String, attributes: serde_json::Map<String, serde_json::Value>) -> EntityState {
        let now = Utc::now();
        let old_state = self.states.get(&entity_id).map(|e| e.value().clone());

        if let Some(prev) = &old_state {
            if prev.state == state && prev.attributes == attributes {
                let mut reported = prev.clone();
                reported.last_reported = now;
                self.states.insert(entity_id, reported.clone());
                return reported;
            }
        }

        let (last_changed, last_updated) = match &old_state {
            Some(prev) if prev.state == state => (prev.last_changed, now),
            _ => (now, now),
        };

        let new_state = EntityState {
            entity_id: entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated,
            last_reported: now,
            context: Context::new(),
        };

        self.states.insert(entity_id.clone(), new_state.clone());

        // Ignore error if no subscribers
        let _ = self.event_tx.send(StateChangedEvent {
            entity_id,
            old_state,
            new_state: new_state.clone(),
        });

        new_state
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChangedEvent> {
        self.event_tx.subscribe()
    }

    /// Number of entities currently tracked
    pub fn len(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(unit: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("unit_of_measurement".into(), json!(unit));
        m
    }

    #[test]
    fn test_set_and_get() {
        let sm = StateMachine::new(16);
        sm.set("sensor.compressor_frequency".into(), "4500".into(), attrs("Hz"));
        let s = sm.get("sensor.compressor_frequency").unwrap();
        assert_eq!(s.state, "4500");
        assert_eq!(sm.len(), 1);
        assert!(sm.get("sensor.missing").is_none());
    }

    #[test]
    fn test_attribute_change_keeps_last_changed() {
        let sm = StateMachine::new(16);
        let first = sm.set("select.haier_mode".into(), "ECO".into(), attrs("a"));
        let second = sm.set("select.haier_mode".into(), "ECO".into(), attrs("b"));
        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated >= first.last_updated);

        let third = sm.set("select.haier_mode".into(), "TURBO".into(), attrs("b"));
        assert!(third.last_changed >= second.last_changed);
        assert_eq!(third.state, "TURBO");
    }

    #[test]
    fn test_events_only_on_change() {
        let sm = StateMachine::new(16);
        let mut rx = sm.subscribe();

        sm.set("select.haier_state".into(), "HEAT".into(), attrs("x"));
        sm.set("select.haier_state".into(), "HEAT".into(), attrs("x"));
        sm.set("select.haier_state".into(), "COOL".into(), attrs("x"));

        let first = rx.try_recv().unwrap();
        assert!(first.old_state.is_none());
        assert_eq!(first.new_state.state, "HEAT");

        let second = rx.try_recv().unwrap();
        assert_eq!(second.old_state.unwrap().state, "HEAT");
        assert_eq!(second.new_state.state, "COOL");

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_get_all_sorted() {
        let sm = StateMachine::new(16);
        sm.set("sensor.b".into(), "1".into(), serde_json::Map::new());
        sm.set("select.a".into(), "OFF".into(), serde_json::Map::new());
        let ids: Vec<String> = sm.get_all().into_iter().map(|s| s.entity_id).collect();
        assert_eq!(ids, vec!["select.a", "sensor.b"]);
    }
}
