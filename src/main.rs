mod api;
mod bridge;
mod client;
mod codemap;
mod config;
mod integrations;
mod locator;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use api::{ApiState, AppState};
use client::SharedClient;
use integrations::haier::{HaierIntegration, MATTER_DOMAIN};
use integrations::matter::{MatterWsClient, ServerStatus};
use locator::{ClientAdapter, ConfigEntry, EntryState, HostRegistry, Slot};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,haier_bridge=debug")),
        )
        .init();

    tracing::info!("Starting haier-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("HAIER_BRIDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(config::DEFAULT_CONFIG_PATH));
    let mut config = config::Config::load(&config_path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    let entry = config.entry()?.clone();

    let app_state = Arc::new(AppState::new(state::StateMachine::new(1024)));

    // The Matter integration registers its client the way the host does.
    // Until the first connection succeeds its entry is not LOADED, so the
    // client is only reachable through the integration data table.
    let matter = MatterWsClient::start(config.matter.clone());
    let startup_wait = Duration::from_secs(config.matter.request_timeout_secs);
    matter
        .wait_status(startup_wait, |s| *s != ServerStatus::Connecting)
        .await;
    let status = matter.watch_status();
    let startup_status = *status.borrow();
    if startup_status != ServerStatus::Connected {
        tracing::error!(
            "Matter server not reachable at {}, entities stay unavailable until it is",
            config.matter.ws_url
        );
    }
    let registry = Arc::new(matter_registry(matter.clone(), startup_status));

    let haier = Arc::new(HaierIntegration::new(app_state.clone()));
    let created = haier.setup_entry(&registry, &entry).await;
    tracing::info!(
        "Haier bridge set up {} entities for node {} endpoint {}",
        created,
        entry.node_id,
        entry.endpoint_id
    );

    let follower = haier.clone();
    let online = startup_status == ServerStatus::Connected;
    tokio::spawn(async move { follower.follow_connection(status, online).await });

    spawn_state_logger(app_state.clone());

    let app = api::router(ApiState {
        app: app_state,
        haier: haier.clone(),
        registry,
        matter: Some(matter),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    haier.unload();
    Ok(())
}

/// Registry as the host would hold it for one Matter config entry: the
/// client in `runtime_data` once loaded, and always in the domain's data
/// table under the entry id.
fn matter_registry(client: Arc<MatterWsClient>, status: ServerStatus) -> HostRegistry {
    let entry_id = uuid::Uuid::new_v4().simple().to_string();
    let state = match status {
        ServerStatus::Connected => EntryState::Loaded,
        ServerStatus::Connecting => EntryState::SetupInProgress,
        ServerStatus::Disconnected => EntryState::SetupError,
    };
    let adapter = Slot::Adapter(Arc::new(ClientAdapter::new(client as SharedClient)));

    HostRegistry {
        entries: vec![ConfigEntry {
            entry_id: entry_id.clone(),
            domain: MATTER_DOMAIN.to_string(),
            state,
            runtime_data: (state == EntryState::Loaded).then(|| adapter.clone()),
        }],
        data: vec![(MATTER_DOMAIN.to_string(), Slot::Table(vec![(entry_id, adapter)]))],
    }
}

/// Log every entity state change at debug level.
fn spawn_state_logger(app: Arc<AppState>) {
    let mut rx = app.state_machine.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let old = event
                        .old_state
                        .as_ref()
                        .map(|s| s.state.as_str())
                        .unwrap_or("none");
                    tracing::debug!(
                        entity_id = %event.entity_id,
                        "State changed: {} -> {}",
                        old,
                        event.new_state.state
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("State logger lagged by {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
