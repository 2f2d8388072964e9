use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use argus_cache::monitor::ConnectivityMonitor;
use argus_cache::sync::FallbackSyncService;
use argus_cache::tier::CacheTier;
use argus_cache::FallbackQueue;
use argus_core::ids::ClientId;
use argus_engine::IngestPipeline;
use argus_store::Database;

use crate::bridge;
use crate::handlers::{self, AppState};
use crate::hub::{self, SubscriberRegistry};
use crate::wire::ServerMessage;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
    pub backlog_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            max_send_queue: 256,
            backlog_size: 100,
        }
    }
}

/// Everything the server boundary needs from the rest of the system.
pub struct ServerDeps {
    pub pipeline: Arc<IngestPipeline>,
    pub db: Database,
    pub cache: Arc<dyn CacheTier>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub fallback: Arc<FallbackQueue>,
    pub sync: Arc<FallbackSyncService>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events", post(handlers::post_event))
        .route("/events/recent", get(handlers::recent_events))
        .route("/events/session/{id}", get(handlers::session_events))
        .route("/stream", get(ws_handler))
        .route("/health", get(handlers::health))
        .route("/fallback/status", get(handlers::fallback_status))
        .route("/fallback/test-redis", post(handlers::test_redis))
        .route("/fallback/sync", post(handlers::force_sync))
        .route(
            "/fallback/sync-queue",
            get(handlers::get_sync_queue).delete(handlers::purge_sync_queue),
        )
        .route("/fallback/sync-config", put(handlers::put_sync_config))
        .route("/fallback/health", get(handlers::fallback_health))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the
/// background tasks alive.
pub async fn start(config: ServerConfig, deps: ServerDeps) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SubscriberRegistry::new(config.max_send_queue));

    // Engine updates → connected subscribers.
    let bridge_handle = bridge::create_bridge(Arc::clone(&registry), deps.pipeline.updates());

    let cleanup_handle =
        hub::start_cleanup_task(Arc::clone(&registry), std::time::Duration::from_secs(60));

    let (message_tx, message_rx) = mpsc::channel::<(ClientId, String)>(1024);

    let state = AppState {
        pipeline: deps.pipeline,
        db: deps.db,
        cache: deps.cache,
        monitor: deps.monitor,
        fallback: deps.fallback,
        sync: deps.sync,
        registry: Arc::clone(&registry),
        message_tx,
        backlog_size: config.backlog_size,
    };

    let messages_handle = tokio::spawn(handlers::process_client_messages(
        message_rx,
        state.clone(),
    ));

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "argus server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _bridge: bridge_handle,
        _cleanup: cleanup_handle,
        _messages: messages_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
    _messages: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade for /stream.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

/// Register the subscriber, send the `initial` backlog, then run the
/// connection loop.
async fn handle_stream(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.registry.register();
    tracing::info!(client_id = %client_id, "stream subscriber connected");

    let events = handlers::read_recent(&state, state.backlog_size)
        .await
        .unwrap_or_default();
    if let Some(json) = (ServerMessage::Initial { events }).to_json() {
        state.registry.send_to(&client_id, json);
    }

    hub::handle_ws_connection(
        socket,
        client_id,
        rx,
        Arc::clone(&state.registry),
        state.message_tx.clone(),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_cache::sync::SyncConfig;
    use argus_cache::MemoryTier;
    use serde_json::json;
    use tokio::sync::broadcast;

    fn deps() -> (ServerDeps, Arc<MemoryTier>) {
        let db = Database::in_memory().unwrap();
        let tier = Arc::new(MemoryTier::new());
        let monitor = Arc::new(ConnectivityMonitor::new(tier.clone(), 3));
        let fallback = Arc::new(FallbackQueue::in_memory().unwrap());
        let (updates_tx, _) = broadcast::channel(256);
        let pipeline = Arc::new(IngestPipeline::new(
            db.clone(),
            tier.clone(),
            monitor.clone(),
            fallback.clone(),
            updates_tx,
            100,
        ));
        let sync = Arc::new(FallbackSyncService::new(
            fallback.clone(),
            tier.clone(),
            monitor.clone(),
            SyncConfig::default(),
        ));
        (
            ServerDeps {
                pipeline,
                db,
                cache: tier.clone(),
                monitor,
                fallback,
                sync,
            },
            tier,
        )
    }

    async fn spawn_server() -> (ServerHandle, String, Arc<MemoryTier>) {
        let (deps, tier) = deps();
        let config = ServerConfig {
            port: 0, // random port
            ..Default::default()
        };
        let handle = start(config, deps).await.unwrap();
        let base = format!("http://127.0.0.1:{}", handle.port);
        (handle, base, tier)
    }

    #[tokio::test]
    async fn serves_health() {
        let (_handle, base, _) = spawn_server().await;
        let resp = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn post_event_roundtrip() {
        let (_handle, base, tier) = spawn_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/events"))
            .json(&json!({
                "source_app": "claude-code",
                "session_id": "sess-http-1",
                "hook_event_type": "SessionStart",
                "payload": {"cwd": "/tmp"},
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["id"].as_i64().unwrap() > 0);
        assert!(body["timestamp"].as_i64().unwrap() > 0);

        // Mirrored into the cache tier.
        assert!(tier.value("session:sess-http-1").is_some());

        // Visible in the recent feed.
        let recent: serde_json::Value = client
            .get(format!("{base}/events/recent"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(recent.as_array().unwrap().len(), 1);

        // And per session.
        let session_events: serde_json::Value = client
            .get(format!("{base}/events/session/sess-http-1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(session_events.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_event_gets_400() {
        let (_handle, base, _) = spawn_server().await;
        let client = reqwest::Client::new();

        // Unknown hook type.
        let resp = client
            .post(format!("{base}/events"))
            .json(&json!({
                "source_app": "app",
                "session_id": "s",
                "hook_event_type": "NotARealHook",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Not JSON at all.
        let resp = client
            .post(format!("{base}/events"))
            .header("content-type", "application/json")
            .body("{{{")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        // Blank session id.
        let resp = client
            .post(format!("{base}/events"))
            .json(&json!({
                "source_app": "app",
                "session_id": "",
                "hook_event_type": "Stop",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn fallback_admin_endpoints() {
        let (_handle, base, tier) = spawn_server().await;
        let client = reqwest::Client::new();

        let status: serde_json::Value = client
            .get(format!("{base}/fallback/status"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["connectivity"]["mode"], "connected");
        assert_eq!(status["queue"]["depth"], 0);

        // Update the sync config.
        let updated: serde_json::Value = client
            .put(format!("{base}/fallback/sync-config"))
            .json(&json!({"batch_size": 25}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(updated["batch_size"], 25);

        // Break the tier; an ingested event lands in the queue.
        tier.set_failing(true);
        client
            .post(format!("{base}/events"))
            .json(&json!({
                "source_app": "app",
                "session_id": "s-out",
                "hook_event_type": "SessionStart",
            }))
            .send()
            .await
            .unwrap();

        let queue: serde_json::Value = client
            .get(format!("{base}/fallback/sync-queue"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(queue["depth"].as_i64().unwrap() > 0);

        // Recover and force a drain.
        tier.set_failing(false);
        let drained: serde_json::Value = client
            .post(format!("{base}/fallback/sync"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(drained["synced"].as_u64().unwrap() > 0);
        assert_eq!(drained["remaining"], 0);

        // Composite health stays OK throughout.
        let health = client
            .get(format!("{base}/fallback/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), 200);
    }

    #[tokio::test]
    async fn test_redis_probe_reports_state() {
        let (_handle, base, tier) = spawn_server().await;
        let client = reqwest::Client::new();

        let probe: serde_json::Value = client
            .post(format!("{base}/fallback/test-redis"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(probe["connected"], true);
        assert_eq!(probe["operations_ok"], true);

        tier.set_failing(true);
        let probe: serde_json::Value = client
            .post(format!("{base}/fallback/test-redis"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(probe["connected"], false);
    }

    #[tokio::test]
    async fn purge_empties_queue() {
        let (_handle, base, tier) = spawn_server().await;
        let client = reqwest::Client::new();

        tier.set_failing(true);
        client
            .post(format!("{base}/events"))
            .json(&json!({
                "source_app": "app",
                "session_id": "s-purge",
                "hook_event_type": "SessionStart",
            }))
            .send()
            .await
            .unwrap();

        let purged: serde_json::Value = client
            .delete(format!("{base}/fallback/sync-queue"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(purged["purged"].as_i64().unwrap() > 0);

        let queue: serde_json::Value = client
            .get(format!("{base}/fallback/sync-queue"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(queue["depth"], 0);
    }

    #[test]
    fn build_router_creates_routes() {
        let (deps, _) = deps();
        let registry = Arc::new(SubscriberRegistry::new(32));
        let (message_tx, _) = mpsc::channel(32);
        let state = AppState {
            pipeline: deps.pipeline,
            db: deps.db,
            cache: deps.cache,
            monitor: deps.monitor,
            fallback: deps.fallback,
            sync: deps.sync,
            registry,
            message_tx,
            backlog_size: 100,
        };
        let _router = build_router(state);
    }
}
