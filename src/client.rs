//! Protocol client seam.
//!
//! Everything the bridge needs from the Matter controller goes through
//! [`ProtocolClient`]: addressed attribute reads and writes, push
//! subscriptions and the node listing used by the device picker.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

pub type NodeId = u64;
pub type EndpointId = u16;
pub type ClusterId = u32;
pub type AttributeId = u32;

/// Errors raised by a protocol client request.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed with error code {code}: {details}")]
    Request { code: i64, details: String },

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection to the Matter server is closed")]
    Disconnected,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unexpected message from the Matter server: {0}")]
    Protocol(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// One pushed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeReport {
    pub node_id: NodeId,
    pub endpoint_id: EndpointId,
    pub cluster_id: ClusterId,
    pub attribute_id: AttributeId,
    pub value: Value,
}

/// Push-update handler registered with [`ProtocolClient::subscribe_attribute`].
pub type AttributeCallback = Arc<dyn Fn(AttributeReport) + Send + Sync>;

/// Handle returned by a subscription, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A commissioned node as reported by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub available: bool,
    pub node_label: Option<String>,
}

impl NodeDescriptor {
    /// Label shown in the device picker, falling back to the node number.
    pub fn display_name(&self) -> String {
        match self.node_label.as_deref() {
            Some(label) if !label.is_empty() => label.to_string(),
            _ => format!("Node {}", self.node_id),
        }
    }
}

/// Render a Matter attribute path (`endpoint/cluster/attribute`).
pub fn attribute_path(endpoint_id: EndpointId, cluster_id: ClusterId, attribute_id: AttributeId) -> String {
    format!("{}/{}/{}", endpoint_id, cluster_id, attribute_id)
}

/// Parse an attribute path back into its three ids.
pub fn parse_attribute_path(path: &str) -> Option<(EndpointId, ClusterId, AttributeId)> {
    let mut parts = path.split('/');
    let endpoint = parts.next()?.parse().ok()?;
    let cluster = parts.next()?.parse().ok()?;
    let attribute = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((endpoint, cluster, attribute))
}

/// Addressed attribute access on a Matter controller.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn read_attribute(
        &self,
        node_id: NodeId,
        endpoint_id: EndpointId,
        cluster_id: ClusterId,
        attribute_id: AttributeId,
    ) -> ClientResult<Value>;

    async fn write_attribute(
        &self,
        node_id: NodeId,
        endpoint_id: EndpointId,
        cluster_id: ClusterId,
        attribute_id: AttributeId,
        value: Value,
    ) -> ClientResult<()>;

    /// Register `callback` for pushes on one attribute. The callback may
    /// also see reports for other attributes if the client multiplexes.
    async fn subscribe_attribute(
        &self,
        node_id: NodeId,
        endpoint_id: EndpointId,
        cluster_id: ClusterId,
        attribute_id: AttributeId,
        callback: AttributeCallback,
    ) -> ClientResult<SubscriptionId>;

    /// Drop a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, subscription: SubscriptionId);

    async fn get_nodes(&self) -> ClientResult<Vec<NodeDescriptor>>;
}

pub type SharedClient = Arc<dyn ProtocolClient>;

#[cfg(test)]
pub mod mock {
    //! Scriptable in-memory client for tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub struct WriteCall {
        pub node_id: NodeId,
        pub endpoint_id: EndpointId,
        pub cluster_id: ClusterId,
        pub attribute_id: AttributeId,
        pub value: Value,
    }

    #[derive(Default)]
    pub struct MockClient {
        pub values: Mutex<HashMap<(NodeId, EndpointId, ClusterId, AttributeId), Value>>,
        pub writes: Mutex<Vec<WriteCall>>,
        pub reads: AtomicU64,
        pub fail_read: std::sync::atomic::AtomicBool,
        pub fail_write: std::sync::atomic::AtomicBool,
        pub fail_subscribe: std::sync::atomic::AtomicBool,
        pub nodes: Mutex<Vec<NodeDescriptor>>,
        subscriptions: Mutex<HashMap<u64, AttributeCallback>>,
        next_id: AtomicU64,
    }

    impl MockClient {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_value(&self, node: NodeId, endpoint: EndpointId, cluster: ClusterId, attribute: AttributeId, value: Value) {
            self.values.lock().unwrap().insert((node, endpoint, cluster, attribute), value);
        }

        /// Deliver a report to every live subscription, like a shared channel.
        pub fn push(&self, report: AttributeReport) {
            let callbacks: Vec<AttributeCallback> =
                self.subscriptions.lock().unwrap().values().cloned().collect();
            for cb in callbacks {
                cb(report.clone());
            }
        }

        pub fn subscription_count(&self) -> usize {
            self.subscriptions.lock().unwrap().len()
        }

        pub fn write_calls(&self) -> Vec<WriteCall> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProtocolClient for MockClient {
        async fn read_attribute(
            &self,
            node_id: NodeId,
            endpoint_id: EndpointId,
            cluster_id: ClusterId,
            attribute_id: AttributeId,
        ) -> ClientResult<Value> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            if self.fail_read.load(Ordering::Relaxed) {
                return Err(ClientError::Timeout(std::time::Duration::from_secs(1)));
            }
            Ok(self
                .values
                .lock()
                .unwrap()
                .get(&(node_id, endpoint_id, cluster_id, attribute_id))
                .cloned()
                .unwrap_or(Value::Null))
        }

        async fn write_attribute(
            &self,
            node_id: NodeId,
            endpoint_id: EndpointId,
            cluster_id: ClusterId,
            attribute_id: AttributeId,
            value: Value,
        ) -> ClientResult<()> {
            self.writes.lock().unwrap().push(WriteCall {
                node_id,
                endpoint_id,
                cluster_id,
                attribute_id,
                value: value.clone(),
            });
            if self.fail_write.load(Ordering::Relaxed) {
                return Err(ClientError::Request { code: 1, details: "write rejected".into() });
            }
            self.set_value(node_id, endpoint_id, cluster_id, attribute_id, value);
            Ok(())
        }

        async fn subscribe_attribute(
            &self,
            _node_id: NodeId,
            _endpoint_id: EndpointId,
            _cluster_id: ClusterId,
            _attribute_id: AttributeId,
            callback: AttributeCallback,
        ) -> ClientResult<SubscriptionId> {
            if self.fail_subscribe.load(Ordering::Relaxed) {
                return Err(ClientError::Disconnected);
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.subscriptions.lock().unwrap().insert(id, callback);
            Ok(SubscriptionId(id))
        }

        fn unsubscribe(&self, subscription: SubscriptionId) {
            self.subscriptions.lock().unwrap().remove(&subscription.0);
        }

        async fn get_nodes(&self) -> ClientResult<Vec<NodeDescriptor>> {
            Ok(self.nodes.lock().unwrap().clone())
        }
    }
}
