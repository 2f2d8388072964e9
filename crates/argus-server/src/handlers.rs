//! HTTP handlers for event intake and fallback administration.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use argus_cache::monitor::ConnectivityMonitor;
use argus_cache::sync::{FallbackSyncService, SyncConfig};
use argus_cache::tier::{CacheTier, RECENT_EVENTS_KEY};
use argus_cache::FallbackQueue;
use argus_core::events::HookEvent;
use argus_core::ids::{ClientId, SessionId};
use argus_core::time::now_ms;
use argus_engine::{IngestPipeline, PipelineError};
use argus_store::events::{EventRepo, EventRow};
use argus_store::sessions::SessionRepo;
use argus_store::{Database, StoreError};

use crate::hub::SubscriberRegistry;

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestPipeline>,
    pub db: Database,
    pub cache: Arc<dyn CacheTier>,
    pub monitor: Arc<ConnectivityMonitor>,
    pub fallback: Arc<FallbackQueue>,
    pub sync: Arc<FallbackSyncService>,
    pub registry: Arc<SubscriberRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
    pub backlog_size: u32,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        if e.is_validation() {
            Self::BadRequest(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => Self::NotFound(m),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<argus_cache::CacheError> for ApiError {
    fn from(e: argus_cache::CacheError) -> Self {
        Self::Internal(e.to_string())
    }
}

// ── Intake ──

/// POST /events — validate, persist, mirror, broadcast.
pub async fn post_event(
    State(state): State<AppState>,
    body: Result<Json<HookEvent>, JsonRejection>,
) -> Result<Json<EventRow>, ApiError> {
    let Json(event) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let row = state.pipeline.record(event).await?;
    Ok(Json(row))
}

#[derive(Deserialize)]
pub struct RecentQuery {
    pub limit: Option<u32>,
}

/// GET /events/recent — cache-first while connected, durable store
/// otherwise.
pub async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<EventRow>>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(1000);
    Ok(Json(read_recent(&state, limit).await?))
}

pub async fn read_recent(state: &AppState, limit: u32) -> Result<Vec<EventRow>, StoreError> {
    if state.monitor.is_connected() {
        if let Ok(Some(cached)) = state.cache.get(RECENT_EVENTS_KEY).await {
            if let Ok(events) = serde_json::from_str::<Vec<EventRow>>(&cached) {
                let skip = events.len().saturating_sub(limit as usize);
                return Ok(events.into_iter().skip(skip).collect());
            }
        }
    }
    EventRepo::new(state.db.clone()).list_recent(limit)
}

#[derive(Deserialize)]
pub struct SessionEventsQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// GET /events/session/{id}
pub async fn session_events(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<SessionEventsQuery>,
) -> Result<Json<Vec<EventRow>>, ApiError> {
    let events = EventRepo::new(state.db.clone()).list_for_session(
        &SessionId::from_raw(session_id),
        query.limit,
        query.offset,
    )?;
    Ok(Json(events))
}

// ── Health ──

/// GET /health — liveness plus a durable-store round trip.
pub async fn health(State(state): State<AppState>) -> Response {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(StoreError::from)
        })
        .is_ok();

    let status = if db_ok { "healthy" } else { "unhealthy" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "status": status,
            "subscribers": state.registry.count(),
            "cache_mode": state.monitor.mode(),
        })),
    )
        .into_response()
}

// ── Fallback administration ──

/// GET /fallback/status
pub async fn fallback_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let depth = state.fallback.depth()?;
    Ok(Json(json!({
        "connectivity": state.monitor.snapshot(),
        "queue": {"depth": depth},
        "sync": {
            "config": state.sync.config(),
            "stats": state.sync.stats(),
        },
    })))
}

/// POST /fallback/test-redis — on-demand connectivity + operations probe.
pub async fn test_redis(State(state): State<AppState>) -> Json<serde_json::Value> {
    let started = std::time::Instant::now();
    let ping_ok = state.monitor.probe_now().await;

    let mut ops_ok = false;
    let mut error: Option<String> = None;
    if ping_ok {
        let key = format!("argus:selftest:{}", now_ms());
        let roundtrip = async {
            state.cache.set(&key, "ok").await?;
            let value = state.cache.get(&key).await?;
            state.cache.delete(&key).await?;
            Ok::<_, argus_cache::CacheError>(value.as_deref() == Some("ok"))
        };
        match roundtrip.await {
            Ok(ok) => ops_ok = ok,
            Err(e) => error = Some(e.to_string()),
        }
    }

    Json(json!({
        "connected": ping_ok,
        "operations_ok": ops_ok,
        "error": error,
        "latency_ms": started.elapsed().as_millis() as u64,
    }))
}

/// POST /fallback/sync — force a full queue drain.
pub async fn force_sync(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let result = state.sync.drain_all().await?;
    Ok(Json(json!({
        "synced": result.synced,
        "failed": result.failed,
        "permanent_failures": result.permanent,
        "remaining": state.fallback.depth()?,
    })))
}

#[derive(Deserialize)]
pub struct QueueQuery {
    pub limit: Option<u32>,
}

/// GET /fallback/sync-queue
pub async fn get_sync_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let operations = state.fallback.list(query.limit.unwrap_or(100))?;
    Ok(Json(json!({
        "depth": state.fallback.depth()?,
        "operations": operations,
    })))
}

/// DELETE /fallback/sync-queue
pub async fn purge_sync_queue(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let purged = state.fallback.purge()?;
    Ok(Json(json!({"purged": purged})))
}

#[derive(Deserialize)]
pub struct SyncConfigUpdate {
    pub interval_secs: Option<u64>,
    pub batch_size: Option<u32>,
    pub max_retries: Option<u32>,
}

/// PUT /fallback/sync-config — partial update.
pub async fn put_sync_config(
    State(state): State<AppState>,
    body: Result<Json<SyncConfigUpdate>, JsonRejection>,
) -> Result<Json<SyncConfig>, ApiError> {
    let Json(update) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let current = state.sync.config();
    let config = SyncConfig {
        interval_secs: update.interval_secs.unwrap_or(current.interval_secs).max(1),
        batch_size: update.batch_size.unwrap_or(current.batch_size).max(1),
        max_retries: update.max_retries.unwrap_or(current.max_retries),
    };
    state.sync.update_config(config);
    Ok(Json(config))
}

/// GET /fallback/health — composite: healthy while the cache tier OR the
/// fallback store is available.
pub async fn fallback_health(State(state): State<AppState>) -> Response {
    let cache_connected = state.monitor.is_connected();
    let fallback_ok = state.fallback.depth().is_ok();
    let healthy = cache_connected || fallback_ok;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "healthy": healthy,
            "cache_connected": cache_connected,
            "fallback_store_ok": fallback_ok,
        })),
    )
        .into_response()
}

// ── Stream client messages ──

/// Processes inbound WebSocket text frames (`ping`,
/// `get_terminal_status`) and replies on the sender's queue.
pub async fn process_client_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: AppState,
) {
    while let Some((client_id, raw)) = rx.recv().await {
        let message: crate::wire::ClientMessage = match serde_json::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(client_id = %client_id, error = %e, "ignoring malformed client message");
                continue;
            }
        };

        let reply = match message {
            crate::wire::ClientMessage::Ping => crate::wire::ServerMessage::pong(),
            crate::wire::ClientMessage::GetTerminalStatus => {
                match SessionRepo::new(state.db.clone()).list_active() {
                    Ok(active_sessions) => crate::wire::ServerMessage::TerminalStatus(
                        crate::wire::TerminalStatus {
                            active_sessions,
                            timestamp: now_ms(),
                        },
                    ),
                    Err(e) => {
                        tracing::warn!(error = %e, "terminal status query failed");
                        continue;
                    }
                }
            }
        };

        if let Some(json) = reply.to_json() {
            state.registry.send_to(&client_id, json);
        }
    }
}
