//! python-matter-server WebSocket client
//!
//! Talks to python-matter-server over its JSON WebSocket API. The server
//! handles commissioning and fabric management; this client only needs
//! attribute reads, writes, the node list and the `attribute_updated`
//! event stream.
//!
//! Architecture:
//!   haier-bridge ──WebSocket──► python-matter-server ──Thread/Wi-Fi──► Matter devices
//!
//! Commands are `{"message_id", "command", "args"}` and are answered with
//! the same `message_id`. Events arrive unsolicited after
//! `start_listening` and are fanned out to local subscriptions.
//!
//! A background task owns the socket. It reconnects after a drop and
//! publishes connection changes on a watch channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::client::{
    attribute_path, parse_attribute_path, AttributeCallback, AttributeId, AttributeReport,
    ClientError, ClientResult, ClusterId, EndpointId, NodeDescriptor, NodeId, ProtocolClient,
    SubscriptionId,
};

/// Basic Information cluster `NodeLabel` on the root endpoint.
const NODE_LABEL_PATH: &str = "0/40/5";

// ── Configuration ───────────────────────────────────────────

/// Configuration for the Matter server connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatterConfig {
    /// WebSocket URL of the python-matter-server
    pub ws_url: String,
    /// Upper bound for a single request round-trip (seconds)
    pub request_timeout_secs: u64,
    /// Pause between reconnection attempts (seconds)
    pub reconnect_interval_secs: u64,
}

impl Default for MatterConfig {
    fn default() -> Self {
        Self {
            ws_url: std::env::var("MATTER_WS_URL")
                .unwrap_or_else(|_| "ws://localhost:5580/ws".to_string()),
            request_timeout_secs: 30,
            reconnect_interval_secs: 10,
        }
    }
}

/// Connection state to the python-matter-server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServerStatus {
    /// First connection attempt still running
    Connecting,
    Connected,
    /// Connection lost or refused; requests fail until the next reconnect
    Disconnected,
}

/// First message the server sends after the socket opens.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerInfo {
    pub fabric_id: u64,
    pub compressed_fabric_id: u64,
    pub schema_version: u32,
    pub min_supported_schema_version: u32,
    pub sdk_version: String,
    pub wifi_credentials_set: bool,
    pub thread_credentials_set: bool,
}

// ── Client ──────────────────────────────────────────────────

struct Subscription {
    node_id: NodeId,
    endpoint_id: EndpointId,
    cluster_id: ClusterId,
    attribute_id: AttributeId,
    callback: AttributeCallback,
}

type Pending = DashMap<String, oneshot::Sender<ClientResult<Value>>>;
type Subscriptions = DashMap<u64, Subscription>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared between the client handle and its connection task.
struct Link {
    config: MatterConfig,
    pending: Pending,
    /// Local only; survives reconnects
    subscriptions: Subscriptions,
    status: watch::Sender<ServerStatus>,
    server_info: RwLock<ServerInfo>,
}

impl Link {
    fn set_status(&self, next: ServerStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }
}

pub struct MatterWsClient {
    link: Arc<Link>,
    outgoing: mpsc::UnboundedSender<String>,
    next_subscription: AtomicU64,
}

impl MatterWsClient {
    /// Create the client and start its connection task.
    ///
    /// The task connects, reads the server info, sends `start_listening`
    /// and then pumps frames. When the socket drops it fails pending
    /// requests and reconnects every `reconnect_interval_secs` until the
    /// client is dropped.
    pub fn start(config: MatterConfig) -> Arc<Self> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (status, _) = watch::channel(ServerStatus::Connecting);
        let link = Arc::new(Link {
            config,
            pending: DashMap::new(),
            subscriptions: DashMap::new(),
            status,
            server_info: RwLock::new(ServerInfo::default()),
        });

        tokio::spawn(run_connection(link.clone(), outgoing_rx));

        Arc::new(Self {
            link,
            outgoing,
            next_subscription: AtomicU64::new(1),
        })
    }

    pub fn status(&self) -> ServerStatus {
        *self.link.status.borrow()
    }

    /// Follow connection state changes.
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.link.status.subscribe()
    }

    /// Wait until `reached` accepts the connection state. `false` on timeout.
    pub async fn wait_status(
        &self,
        timeout: Duration,
        reached: impl FnMut(&ServerStatus) -> bool,
    ) -> bool {
        let mut status = self.link.status.subscribe();
        let reached_ok = matches!(tokio::time::timeout(timeout, status.wait_for(reached)).await, Ok(Ok(_)));
        reached_ok
    }

    /// Info from the most recent handshake.
    pub fn server_info(&self) -> ServerInfo {
        self.link.server_info.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Send one command and wait for its answer.
    async fn request(&self, command: &str, args: Value) -> ClientResult<Value> {
        if self.status() != ServerStatus::Connected {
            return Err(ClientError::Disconnected);
        }

        let message_id = new_message_id();
        let (tx, rx) = oneshot::channel();
        self.link.pending.insert(message_id.clone(), tx);

        if self.outgoing.send(command_message(&message_id, command, args)).is_err() {
            self.link.pending.remove(&message_id);
            return Err(ClientError::Disconnected);
        }

        let timeout = self.link.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                self.link.pending.remove(&message_id);
                Err(ClientError::Timeout(timeout))
            }
        }
    }
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn command_message(message_id: &str, command: &str, args: Value) -> String {
    json!({
        "message_id": message_id,
        "command": command,
        "args": args,
    })
    .to_string()
}

#[async_trait]
impl ProtocolClient for MatterWsClient {
    async fn read_attribute(
        &self,
        node_id: NodeId,
        endpoint_id: EndpointId,
        cluster_id: ClusterId,
        attribute_id: AttributeId,
    ) -> ClientResult<Value> {
        let path = attribute_path(endpoint_id, cluster_id, attribute_id);
        let result = self
            .request("read_attribute", json!({ "node_id": node_id, "attribute_path": path }))
            .await?;
        Ok(unwrap_read_result(result, &path))
    }

    async fn write_attribute(
        &self,
        node_id: NodeId,
        endpoint_id: EndpointId,
        cluster_id: ClusterId,
        attribute_id: AttributeId,
        value: Value,
    ) -> ClientResult<()> {
        let path = attribute_path(endpoint_id, cluster_id, attribute_id);
        self.request(
            "write_attribute",
            json!({ "node_id": node_id, "attribute_path": path, "value": value }),
        )
        .await?;
        Ok(())
    }

    async fn subscribe_attribute(
        &self,
        node_id: NodeId,
        endpoint_id: EndpointId,
        cluster_id: ClusterId,
        attribute_id: AttributeId,
        callback: AttributeCallback,
    ) -> ClientResult<SubscriptionId> {
        // Registration is local and outlives reconnects
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.link.subscriptions.insert(
            id,
            Subscription { node_id, endpoint_id, cluster_id, attribute_id, callback },
        );
        Ok(SubscriptionId(id))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.link.subscriptions.remove(&subscription.0);
    }

    async fn get_nodes(&self) -> ClientResult<Vec<NodeDescriptor>> {
        let result = self.request("get_nodes", json!({})).await?;
        let nodes = result
            .as_array()
            .ok_or_else(|| ClientError::Protocol("get_nodes did not return a list".into()))?;
        Ok(nodes.iter().filter_map(parse_node).collect())
    }
}

// ── Connection task ─────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum SessionEnd {
    Lost,
    /// Every client handle is gone
    ClientDropped,
}

async fn run_connection(link: Arc<Link>, mut outgoing_rx: mpsc::UnboundedReceiver<String>) {
    let retry = Duration::from_secs(link.config.reconnect_interval_secs);

    loop {
        match open_session(&link).await {
            Ok(stream) => {
                link.set_status(ServerStatus::Connected);
                let end = pump(&link, stream, &mut outgoing_rx).await;
                link.set_status(ServerStatus::Disconnected);
                fail_pending(&link.pending);
                if end == SessionEnd::ClientDropped {
                    return;
                }
                tracing::warn!("Matter server connection lost, will retry in {}s", retry.as_secs());
            }
            Err(e) => {
                link.set_status(ServerStatus::Disconnected);
                tracing::warn!(
                    "Matter server at {} unavailable: {}, will retry in {}s",
                    link.config.ws_url,
                    e,
                    retry.as_secs()
                );
            }
        }

        // Commands queued while disconnected have no session to go to
        let pause = tokio::time::sleep(retry);
        tokio::pin!(pause);
        loop {
            tokio::select! {
                _ = &mut pause => break,
                queued = outgoing_rx.recv() => match queued {
                    Some(_) => fail_pending(&link.pending),
                    None => return,
                },
            }
        }
    }
}

/// Connect, read the server info and register for events.
async fn open_session(link: &Link) -> ClientResult<WsStream> {
    tracing::info!("Connecting to Matter server at {}", link.config.ws_url);
    let (mut stream, _) = connect_async(link.config.ws_url.as_str())
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let timeout = link.request_timeout();
    let info = tokio::time::timeout(timeout, handshake(&mut stream, link))
        .await
        .map_err(|_| ClientError::Timeout(timeout))??;

    tracing::info!(
        "Matter server connected (sdk {}, schema {})",
        info.sdk_version,
        info.schema_version
    );
    *link.server_info.write().unwrap_or_else(|e| e.into_inner()) = info;
    Ok(stream)
}

async fn handshake(stream: &mut WsStream, link: &Link) -> ClientResult<ServerInfo> {
    let info: ServerInfo = serde_json::from_str(&next_text(stream).await?)?;

    let message_id = new_message_id();
    stream
        .send(Message::Text(command_message(&message_id, "start_listening", json!({}))))
        .await?;

    loop {
        let text = next_text(stream).await?;
        let msg: Value = serde_json::from_str(&text)?;
        if msg.get("message_id").and_then(|v| v.as_str()) == Some(message_id.as_str()) {
            parse_response(&msg)?;
            return Ok(info);
        }
        route_message(&text, &link.pending, &link.subscriptions);
    }
}

async fn next_text(stream: &mut WsStream) -> ClientResult<String> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text),
            Some(Ok(Message::Close(_))) | None => return Err(ClientError::Disconnected),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Multiplex outgoing commands and incoming frames until either side ends.
async fn pump(
    link: &Link,
    stream: WsStream,
    outgoing_rx: &mut mpsc::UnboundedReceiver<String>,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    route_message(&text, &link.pending, &link.subscriptions);
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Matter server connection error: {}", e);
                    return SessionEnd::Lost;
                }
            },
            command = outgoing_rx.recv() => match command {
                Some(text) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        tracing::warn!("Matter server send failed: {}", e);
                        return SessionEnd::Lost;
                    }
                }
                None => {
                    let _ = write.close().await;
                    return SessionEnd::ClientDropped;
                }
            },
        }
    }
}

// ── Message routing ─────────────────────────────────────────

/// Route one text frame to the waiting request or to subscriptions.
fn route_message(text: &str, pending: &Pending, subscriptions: &Subscriptions) {
    let msg: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Ignoring malformed Matter server message: {}", e);
            return;
        }
    };

    if let Some(message_id) = msg.get("message_id").and_then(|v| v.as_str()) {
        let Some((_, tx)) = pending.remove(message_id) else {
            tracing::debug!(message_id = %message_id, "Response for unknown request");
            return;
        };
        let _ = tx.send(parse_response(&msg));
        return;
    }

    match msg.get("event").and_then(|v| v.as_str()) {
        Some("attribute_updated") => {
            if let Some(report) = parse_attribute_updated(msg.get("data").unwrap_or(&Value::Null)) {
                dispatch_report(subscriptions, report);
            }
        }
        Some(other) => tracing::debug!(event = %other, "Unhandled Matter server event"),
        None => {}
    }
}

/// `result` on success, `error_code` + `details` on failure.
fn parse_response(msg: &Value) -> ClientResult<Value> {
    match msg.get("error_code") {
        Some(code) => Err(ClientError::Request {
            code: code.as_i64().unwrap_or(-1),
            details: msg
                .get("details")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string(),
        }),
        None => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
    }
}

/// `attribute_updated` data is `[node_id, "endpoint/cluster/attribute", value]`.
fn parse_attribute_updated(data: &Value) -> Option<AttributeReport> {
    let items = data.as_array()?;
    let node_id = items.first()?.as_u64()?;
    let (endpoint_id, cluster_id, attribute_id) = parse_attribute_path(items.get(1)?.as_str()?)?;
    Some(AttributeReport {
        node_id,
        endpoint_id,
        cluster_id,
        attribute_id,
        value: items.get(2).cloned().unwrap_or(Value::Null),
    })
}

fn dispatch_report(subscriptions: &Subscriptions, report: AttributeReport) {
    let callbacks: Vec<AttributeCallback> = subscriptions
        .iter()
        .filter(|s| {
            s.node_id == report.node_id
                && s.endpoint_id == report.endpoint_id
                && s.cluster_id == report.cluster_id
                && s.attribute_id == report.attribute_id
        })
        .map(|s| s.callback.clone())
        .collect();

    for callback in callbacks {
        callback(report.clone());
    }
}

fn fail_pending(pending: &Pending) {
    let ids: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(ClientError::Disconnected));
        }
    }
}

/// Newer servers answer reads with `{path: value}`, older ones with the value.
fn unwrap_read_result(result: Value, path: &str) -> Value {
    match result {
        Value::Object(mut map) if map.contains_key(path) => map.remove(path).unwrap_or(Value::Null),
        other => other,
    }
}

fn parse_node(node: &Value) -> Option<NodeDescriptor> {
    let node_id = node.get("node_id")?.as_u64()?;
    let available = node.get("available").and_then(|v| v.as_bool()).unwrap_or(false);
    let node_label = node
        .get("attributes")
        .and_then(|a| a.get(NODE_LABEL_PATH))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(NodeDescriptor { node_id, available, node_label })
}

// ── Tests ───────────────────────────────────────────────────
