use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

use crate::bridge::WriteOutcome;
use crate::integrations::haier::{device_choices, EntitySummary, HaierIntegration};
use crate::integrations::matter::MatterWsClient;
use crate::locator::HostRegistry;
use crate::state::{EntityState, StateMachine};

/// Shared application state
pub struct AppState {
    pub state_machine: StateMachine,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(state_machine: StateMachine) -> Self {
        Self {
            state_machine,
            started_at: Instant::now(),
        }
    }
}

/// Everything the HTTP handlers need
#[derive(Clone)]
pub struct ApiState {
    pub app: Arc<AppState>,
    pub haier: Arc<HaierIntegration>,
    pub registry: Arc<HostRegistry>,
    /// The concrete client, for connection details in /api/health
    pub matter: Option<Arc<MatterWsClient>>,
}

/// POST /api/select/{entity_id} request body
#[derive(Debug, Deserialize)]
pub struct SelectOptionRequest {
    pub option: String,
}

/// GET /api/ response
#[derive(Serialize)]
struct ApiStatus {
    message: String,
}

/// One row of the device picker
#[derive(Debug, Serialize)]
struct NodeChoice {
    node_id: u64,
    label: String,
    available: bool,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "message": message.into() })))
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/", get(api_status))
        .route("/api/health", get(health))
        .route("/api/states", get(get_states))
        .route("/api/states/:entity_id", get(get_state))
        .route("/api/select/:entity_id", post(select_option))
        .route("/api/haier/entities", get(haier_entities))
        .route("/api/matter/nodes", get(matter_nodes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /api/ — API running check
async fn api_status() -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API running.".to_string(),
    })
}

/// GET /api/states — return all entity states
async fn get_states(State(api): State<ApiState>) -> Json<Vec<EntityState>> {
    Json(api.app.state_machine.get_all())
}

/// GET /api/states/{entity_id} — return single entity state
async fn get_state(
    State(api): State<ApiState>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityState>, StatusCode> {
    api.app
        .state_machine
        .get(&entity_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /api/select/{entity_id} — choose an option on a select entity
async fn select_option(
    State(api): State<ApiState>,
    Path(entity_id): Path<String>,
    Json(body): Json<SelectOptionRequest>,
) -> Result<Json<EntityState>, ApiError> {
    tracing::info!(entity_id = %entity_id, option = %body.option, "Select option");

    match api.haier.select_option(&entity_id, &body.option).await {
        None => Err(api_error(StatusCode::NOT_FOUND, format!("Entity {} not found", entity_id))),
        Some(WriteOutcome::Written) => api
            .app
            .state_machine
            .get(&entity_id)
            .map(Json)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Entity {} not found", entity_id))),
        Some(WriteOutcome::UnrecognizedOption) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Option {} is not valid for {}", body.option, entity_id),
        )),
        Some(WriteOutcome::NotSelectable) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("{} is not a select entity", entity_id),
        )),
        Some(WriteOutcome::Inactive) => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("{} is unavailable", entity_id),
        )),
        Some(WriteOutcome::Failed) => Err(api_error(
            StatusCode::BAD_GATEWAY,
            format!("Write to {} failed", entity_id),
        )),
    }
}

/// GET /api/haier/entities — bridge-level view of the vendor entities
async fn haier_entities(State(api): State<ApiState>) -> Json<Vec<EntitySummary>> {
    Json(api.haier.summaries())
}

/// GET /api/matter/nodes — commissioned nodes for picking a device
async fn matter_nodes(State(api): State<ApiState>) -> Result<Json<Vec<NodeChoice>>, ApiError> {
    let client = api
        .haier
        .resolve_client(&api.registry)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    let nodes = client.get_nodes().await.map_err(|e| {
        tracing::error!("Failed to list Matter nodes: {}", e);
        api_error(StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    let choices = device_choices(&nodes)
        .into_iter()
        .zip(nodes.iter())
        .map(|((node_id, label), node)| NodeChoice {
            node_id,
            label,
            available: node.available,
        })
        .collect();
    Ok(Json(choices))
}

/// GET /api/health — health check with connection details
async fn health(State(api): State<ApiState>) -> Json<serde_json::Value> {
    let pid = std::process::id();
    let rss_kb = read_rss_kb(pid).unwrap_or(0);

    let matter = api.matter.as_ref().map(|client| {
        let info = client.server_info();
        json!({
            "status": client.status(),
            "sdk_version": info.sdk_version,
            "schema_version": info.schema_version,
        })
    });

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "entity_count": api.app.state_machine.len(),
        "bridge_count": api.haier.entity_count(),
        "matter": matter,
        "memory_rss_kb": rss_kb,
        "uptime_seconds": api.app.started_at.elapsed().as_secs(),
    }))
}

/// Read RSS from /proc/{pid}/status on Linux
fn read_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            return parts.get(1)?.parse().ok();
        }
    }
    None
}
