//! Attribute synchronization bridge.
//!
//! An [`AttributeBridge`] mirrors one vendor attribute of one device
//! endpoint. It subscribes for pushes, seeds its value with a read,
//! translates wire codes to labels when it has a [`CodeMap`], and writes
//! selected labels back as codes.
//!
//! Remote failures never escape a bridge: they are logged with the
//! bridge's display name and leave the local value as it was.

use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;

use crate::client::{
    AttributeCallback, AttributeId, AttributeReport, ClusterId, EndpointId, NodeId, SharedClient,
    SubscriptionId,
};
use crate::codemap::CodeMap;

/// A physical device and one of its endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceAddress {
    pub node_id: NodeId,
    pub endpoint_id: EndpointId,
}

/// One attribute inside a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttributeKey {
    pub cluster_id: ClusterId,
    pub attribute_id: AttributeId,
}

/// Last known value of the mirrored attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BridgeValue {
    Unknown,
    Label(String),
    Raw(Value),
}

impl BridgeValue {
    /// Host state string for this value.
    pub fn as_state(&self) -> String {
        match self {
            BridgeValue::Unknown => "unknown".to_string(),
            BridgeValue::Label(label) => label.clone(),
            BridgeValue::Raw(Value::String(s)) => s.clone(),
            BridgeValue::Raw(v) => v.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeStatus {
    Uninitialized,
    Synced,
    Degraded,
    Deactivated,
}

/// Result of [`AttributeBridge::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The label is not one of the bridge's options; nothing was sent.
    UnrecognizedOption,
    /// Numeric bridges have no options to select.
    NotSelectable,
    /// The bridge has been deactivated.
    Inactive,
    /// The client rejected or failed the request; already logged.
    Failed,
}

/// Called after every change to a bridge's value.
pub type ChangeHook = Arc<dyn Fn(&BridgeValue) + Send + Sync>;

/// State shared between the bridge and its push callback.
struct Shared {
    name: String,
    address: DeviceAddress,
    key: AttributeKey,
    codes: Option<Arc<CodeMap>>,
    value: RwLock<BridgeValue>,
    status: RwLock<BridgeStatus>,
    hook: Option<ChangeHook>,
}

impl Shared {
    fn translate(&self, wire: &Value) -> BridgeValue {
        match &self.codes {
            Some(codes) => wire
                .as_u64()
                .and_then(|code| codes.label(code))
                .map(|label| BridgeValue::Label(label.to_string()))
                .unwrap_or(BridgeValue::Unknown),
            None if wire.is_null() => BridgeValue::Unknown,
            None => BridgeValue::Raw(wire.clone()),
        }
    }

    fn status(&self) -> BridgeStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next` unless the bridge has already been deactivated.
    fn transition(&self, next: BridgeStatus) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        if *status != BridgeStatus::Deactivated {
            *status = next;
        }
    }

    /// Store `value` and fire the hook, unless the bridge is deactivated.
    /// Holds the status lock across the hook; `deactivate` waits for it.
    fn store(&self, value: BridgeValue) -> bool {
        let status = self.status.read().unwrap_or_else(|e| e.into_inner());
        if *status == BridgeStatus::Deactivated {
            return false;
        }
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = value.clone();
        if let Some(hook) = &self.hook {
            hook(&value);
        }
        true
    }

    fn handle_report(&self, report: AttributeReport) {
        if report.cluster_id != self.key.cluster_id
            || report.attribute_id != self.key.attribute_id
            || report.node_id != self.address.node_id
            || report.endpoint_id != self.address.endpoint_id
        {
            return;
        }

        let value = self.translate(&report.value);
        if self.store(value.clone()) {
            tracing::debug!(bridge = %self.name, state = %value.as_state(), "Attribute pushed");
            self.transition(BridgeStatus::Synced);
        }
    }
}

/// Local mirror of one remote vendor attribute.
pub struct AttributeBridge {
    client: SharedClient,
    shared: Arc<Shared>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl AttributeBridge {
    /// Without `codes` the bridge passes numeric values through untouched.
    /// `hook` runs after every change to the value.
    pub fn new(
        client: SharedClient,
        address: DeviceAddress,
        key: AttributeKey,
        name: impl Into<String>,
        codes: Option<Arc<CodeMap>>,
        hook: Option<ChangeHook>,
    ) -> Self {
        Self {
            client,
            shared: Arc::new(Shared {
                name: name.into(),
                address,
                key,
                codes,
                value: RwLock::new(BridgeValue::Unknown),
                status: RwLock::new(BridgeStatus::Uninitialized),
                hook,
            }),
            subscription: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn address(&self) -> DeviceAddress {
        self.shared.address
    }

    pub fn key(&self) -> AttributeKey {
        self.shared.key
    }

    pub fn current_value(&self) -> BridgeValue {
        self.shared.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> BridgeStatus {
        self.shared.status()
    }

    /// Selectable labels, empty for numeric bridges.
    pub fn options(&self) -> Vec<String> {
        self.shared.codes.as_ref().map(|c| c.options()).unwrap_or_default()
    }

    /// Subscribe for pushes, then seed the value with one read.
    ///
    /// Each step is independently fallible. A failed subscribe skips the
    /// read; a failed read keeps the subscription so later pushes still
    /// land. Either failure leaves the bridge `Degraded`.
    pub async fn activate(&self) {
        if self.status() == BridgeStatus::Deactivated {
            return;
        }
        let DeviceAddress { node_id, endpoint_id } = self.shared.address;
        let AttributeKey { cluster_id, attribute_id } = self.shared.key;

        let shared = self.shared.clone();
        let callback: AttributeCallback = Arc::new(move |report| shared.handle_report(report));

        match self
            .client
            .subscribe_attribute(node_id, endpoint_id, cluster_id, attribute_id, callback)
            .await
        {
            Ok(id) => {
                let previous = self
                    .subscription
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .replace(id);
                if let Some(previous) = previous {
                    self.client.unsubscribe(previous);
                }
            }
            Err(e) => {
                tracing::error!("Haier bridge: subscription failed for {}: {}", self.shared.name, e);
                self.shared.transition(BridgeStatus::Degraded);
                return;
            }
        }

        self.refresh().await;
    }

    /// Read the attribute once and store the result. Used to seed the
    /// value on activation and to catch up after a reconnect.
    pub async fn refresh(&self) {
        if self.status() == BridgeStatus::Deactivated {
            return;
        }
        let DeviceAddress { node_id, endpoint_id } = self.shared.address;
        let AttributeKey { cluster_id, attribute_id } = self.shared.key;

        match self
            .client
            .read_attribute(node_id, endpoint_id, cluster_id, attribute_id)
            .await
        {
            Ok(wire) => {
                let value = self.shared.translate(&wire);
                tracing::debug!(bridge = %self.shared.name, state = %value.as_state(), "Read");
                if self.shared.store(value) {
                    self.shared.transition(BridgeStatus::Synced);
                }
            }
            Err(e) => {
                tracing::error!("Haier bridge: read failed for {}: {}", self.shared.name, e);
                self.shared.transition(BridgeStatus::Degraded);
            }
        }
    }

    /// Send `label` to the device as its wire code.
    ///
    /// On success the value is updated immediately, without waiting for
    /// the device to echo it back.
    pub async fn write(&self, label: &str) -> WriteOutcome {
        if self.status() == BridgeStatus::Deactivated {
            return WriteOutcome::Inactive;
        }
        let Some(codes) = &self.shared.codes else {
            return WriteOutcome::NotSelectable;
        };
        let Some(code) = codes.code(label) else {
            tracing::debug!(bridge = %self.shared.name, option = %label, "Ignoring unrecognized option");
            return WriteOutcome::UnrecognizedOption;
        };

        let DeviceAddress { node_id, endpoint_id } = self.shared.address;
        let AttributeKey { cluster_id, attribute_id } = self.shared.key;

        match self
            .client
            .write_attribute(node_id, endpoint_id, cluster_id, attribute_id, Value::from(code))
            .await
        {
            Ok(()) => {
                if !self.shared.store(BridgeValue::Label(label.to_string())) {
                    return WriteOutcome::Inactive;
                }
                self.shared.transition(BridgeStatus::Synced);
                WriteOutcome::Written
            }
            Err(e) => {
                tracing::error!("Haier bridge: write failed for {}: {}", self.shared.name, e);
                WriteOutcome::Failed
            }
        }
    }

    /// Unregister the push callback. Safe to call more than once.
    pub fn deactivate(&self) {
        *self.shared.status.write().unwrap_or_else(|e| e.into_inner()) = BridgeStatus::Deactivated;
        if let Some(id) = self.subscription.lock().unwrap_or_else(|e| e.into_inner()).take() {
            self.client.unsubscribe(id);
            tracing::debug!(bridge = %self.shared.name, subscription = %id, "Unsubscribed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::client::mock::MockClient;

    const CLUSTER: ClusterId = 0xFC01;

    fn address() -> DeviceAddress {
        DeviceAddress { node_id: 5, endpoint_id: 1 }
    }

    fn key(attribute_id: AttributeId) -> AttributeKey {
        AttributeKey { cluster_id: CLUSTER, attribute_id }
    }

    fn state_codes() -> Arc<CodeMap> {
        Arc::new(CodeMap::new([(0, "OFF"), (1, "HEAT"), (2, "COOL")]).unwrap())
    }

    fn mode_codes() -> Arc<CodeMap> {
        Arc::new(CodeMap::new([(0, "ECO"), (1, "QUIET"), (2, "TURBO")]).unwrap())
    }

    fn report(attribute_id: AttributeId, value: Value) -> AttributeReport {
        AttributeReport { node_id: 5, endpoint_id: 1, cluster_id: CLUSTER, attribute_id, value }
    }

    #[tokio::test]
    async fn test_activate_translates_initial_read() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0001, json!(1));
        let bridge = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);

        assert_eq!(bridge.status(), BridgeStatus::Uninitialized);
        bridge.activate().await;

        assert_eq!(bridge.current_value(), BridgeValue::Label("HEAT".into()));
        assert_eq!(bridge.status(), BridgeStatus::Synced);
        assert_eq!(client.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_code_reads_as_unknown() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0001, json!(7));
        let bridge = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);
        bridge.activate().await;
        assert_eq!(bridge.current_value(), BridgeValue::Unknown);
        assert_eq!(bridge.current_value().as_state(), "unknown");
    }

    #[tokio::test]
    async fn test_numeric_passthrough() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0003, json!(4500));
        let bridge = AttributeBridge::new(client.clone(), address(), key(0x0003), "Compressor Frequency", None, None);
        bridge.activate().await;

        assert_eq!(bridge.current_value(), BridgeValue::Raw(json!(4500)));
        assert_eq!(bridge.current_value().as_state(), "4500");

        client.push(report(0x0003, json!(61.5)));
        assert_eq!(bridge.current_value(), BridgeValue::Raw(json!(61.5)));
    }

    #[tokio::test]
    async fn test_push_filtered_by_attribute() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0001, json!(0));
        client.set_value(5, 1, CLUSTER, 0x0002, json!(0));
        let state = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);
        let mode = AttributeBridge::new(client.clone(), address(), key(0x0002), "Haier Mode", Some(mode_codes()), None);
        state.activate().await;
        mode.activate().await;

        client.push(report(0x0002, json!(2)));

        assert_eq!(mode.current_value(), BridgeValue::Label("TURBO".into()));
        assert_eq!(state.current_value(), BridgeValue::Label("OFF".into()));
    }

    #[tokio::test]
    async fn test_push_for_other_cluster_or_node_ignored() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0002, json!(0));
        let mode = AttributeBridge::new(client.clone(), address(), key(0x0002), "Haier Mode", Some(mode_codes()), None);
        mode.activate().await;

        client.push(AttributeReport { cluster_id: 0x0006, ..report(0x0002, json!(2)) });
        client.push(AttributeReport { node_id: 6, ..report(0x0002, json!(2)) });
        client.push(AttributeReport { endpoint_id: 2, ..report(0x0002, json!(2)) });

        assert_eq!(mode.current_value(), BridgeValue::Label("ECO".into()));
    }

    #[tokio::test]
    async fn test_write_known_label() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0002, json!(2));
        let mode = AttributeBridge::new(client.clone(), address(), key(0x0002), "Haier Mode", Some(mode_codes()), None);
        mode.activate().await;

        assert_eq!(mode.write("ECO").await, WriteOutcome::Written);

        let calls = client.write_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].value, json!(0));
        assert_eq!(calls[0].attribute_id, 0x0002);
        assert_eq!(calls[0].cluster_id, CLUSTER);
        assert_eq!(mode.current_value(), BridgeValue::Label("ECO".into()));
    }

    #[tokio::test]
    async fn test_write_failure_leaves_value() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0002, json!(2));
        let mode = AttributeBridge::new(client.clone(), address(), key(0x0002), "Haier Mode", Some(mode_codes()), None);
        mode.activate().await;
        client.fail_write.store(true, Ordering::Relaxed);

        assert_eq!(mode.write("ECO").await, WriteOutcome::Failed);
        assert_eq!(client.write_calls().len(), 1);
        assert_eq!(mode.current_value(), BridgeValue::Label("TURBO".into()));
    }

    #[tokio::test]
    async fn test_write_unrecognized_label_is_noop() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0001, json!(1));
        let state = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);
        state.activate().await;

        assert_eq!(state.write("FREEZING").await, WriteOutcome::UnrecognizedOption);
        assert!(client.write_calls().is_empty());
        assert_eq!(state.current_value(), BridgeValue::Label("HEAT".into()));
    }

    #[tokio::test]
    async fn test_write_on_sensor_not_selectable() {
        let client = MockClient::new();
        let sensor = AttributeBridge::new(client.clone(), address(), key(0x0003), "Compressor Frequency", None, None);
        assert_eq!(sensor.write("4500").await, WriteOutcome::NotSelectable);
        assert!(client.write_calls().is_empty());
        assert!(sensor.options().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_failure_skips_read() {
        let client = MockClient::new();
        client.fail_subscribe.store(true, Ordering::Relaxed);
        client.set_value(5, 1, CLUSTER, 0x0001, json!(1));
        let state = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);
        state.activate().await;

        assert_eq!(state.status(), BridgeStatus::Degraded);
        assert_eq!(state.current_value(), BridgeValue::Unknown);
        assert_eq!(client.reads.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_read_failure_still_receives_pushes() {
        let client = MockClient::new();
        client.fail_read.store(true, Ordering::Relaxed);
        let state = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);
        state.activate().await;

        assert_eq!(state.status(), BridgeStatus::Degraded);
        assert_eq!(state.current_value(), BridgeValue::Unknown);

        client.push(report(0x0001, json!(2)));
        assert_eq!(state.current_value(), BridgeValue::Label("COOL".into()));
        assert_eq!(state.status(), BridgeStatus::Synced);
    }

    #[tokio::test]
    async fn test_deactivate_stops_delivery() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0002, json!(1));
        let mode = AttributeBridge::new(client.clone(), address(), key(0x0002), "Haier Mode", Some(mode_codes()), None);
        mode.activate().await;
        assert_eq!(client.subscription_count(), 1);

        mode.deactivate();
        mode.deactivate();

        assert_eq!(client.subscription_count(), 0);
        client.push(report(0x0002, json!(2)));
        assert_eq!(mode.current_value(), BridgeValue::Label("QUIET".into()));
        assert_eq!(mode.status(), BridgeStatus::Deactivated);
        assert_eq!(mode.write("ECO").await, WriteOutcome::Inactive);
    }

    #[tokio::test]
    async fn test_hook_fires_on_every_change() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0002, json!(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hook: ChangeHook = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        let mode = AttributeBridge::new(
            client.clone(),
            address(),
            key(0x0002),
            "Haier Mode",
            Some(mode_codes()),
            Some(hook),
        );

        mode.activate().await;
        client.push(report(0x0002, json!(1)));
        client.push(report(0x0001, json!(1)));
        mode.write("TURBO").await;
        mode.write("FREEZING").await;

        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_deactivate_waits_for_in_flight_push() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0002, json!(0));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let entered_tx = Mutex::new(entered_tx);
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let hook: ChangeHook = Arc::new(move |value| {
            if *value == BridgeValue::Label("TURBO".into()) {
                let _ = entered_tx.lock().unwrap().send(());
                std::thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            }
        });
        let mode = AttributeBridge::new(
            client.clone(),
            address(),
            key(0x0002),
            "Haier Mode",
            Some(mode_codes()),
            Some(hook),
        );
        mode.activate().await;

        let pusher = {
            let client = client.clone();
            std::thread::spawn(move || client.push(report(0x0002, json!(2))))
        };
        entered_rx.recv().unwrap();
        mode.deactivate();

        // The push that was already storing completed before deactivate returned
        assert!(finished.load(Ordering::SeqCst));
        pusher.join().unwrap();

        client.push(report(0x0002, json!(1)));
        assert_eq!(mode.current_value(), BridgeValue::Label("TURBO".into()));
        assert_eq!(mode.status(), BridgeStatus::Deactivated);
    }

    #[tokio::test]
    async fn test_refresh_after_deactivate_is_noop() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0001, json!(1));
        let state = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);
        state.activate().await;
        state.deactivate();

        client.set_value(5, 1, CLUSTER, 0x0001, json!(2));
        state.refresh().await;

        assert_eq!(client.reads.load(Ordering::Relaxed), 1);
        assert_eq!(state.current_value(), BridgeValue::Label("HEAT".into()));
    }

    #[tokio::test]
    async fn test_refresh_recovers_degraded_bridge() {
        let client = MockClient::new();
        client.set_value(5, 1, CLUSTER, 0x0001, json!(2));
        client.fail_read.store(true, Ordering::Relaxed);
        let state = AttributeBridge::new(client.clone(), address(), key(0x0001), "Haier State", Some(state_codes()), None);
        state.activate().await;
        assert_eq!(state.status(), BridgeStatus::Degraded);

        client.fail_read.store(false, Ordering::Relaxed);
        state.refresh().await;

        assert_eq!(state.status(), BridgeStatus::Synced);
        assert_eq!(state.current_value(), BridgeValue::Label("COOL".into()));
    }
}
