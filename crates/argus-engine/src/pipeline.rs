use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{instrument, warn};

use argus_cache::monitor::ConnectivityMonitor;
use argus_cache::tier::{self, CacheTier};
use argus_cache::FallbackQueue;
use argus_core::events::{HookEvent, ValidationError};
use argus_core::time::now_ms;
use argus_store::events::{self as store_events, EventRow};
use argus_store::sessions::SessionRow;
use argus_store::{Database, StoreError};

use crate::relationships::RelationshipEngine;
use crate::updates::Update;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid event: {0}")]
    Invalid(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

/// Per-session append locks. Holding the lock across the durable write
/// and the cache mirror preserves per-session ordering end to end;
/// distinct sessions proceed concurrently.
struct SessionLocks {
    locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// The dual-write coordinator: single entry point for persisting a hook
/// event.
///
/// The durable store write (plus relationship effects) is synchronous
/// and transactional; the cache mirror is best-effort with a short
/// timeout, failures landing in the fallback queue. Only a durable-store
/// failure fails the call.
pub struct IngestPipeline {
    db: Database,
    engine: RelationshipEngine,
    cache: Arc<dyn CacheTier>,
    monitor: Arc<ConnectivityMonitor>,
    fallback: Arc<FallbackQueue>,
    updates_tx: broadcast::Sender<Update>,
    session_locks: Mutex<SessionLocks>,
    recent: Mutex<VecDeque<EventRow>>,
    recent_cap: usize,
}

impl IngestPipeline {
    pub fn new(
        db: Database,
        cache: Arc<dyn CacheTier>,
        monitor: Arc<ConnectivityMonitor>,
        fallback: Arc<FallbackQueue>,
        updates_tx: broadcast::Sender<Update>,
        recent_cap: usize,
    ) -> Self {
        Self {
            db,
            engine: RelationshipEngine::new(),
            cache,
            monitor,
            fallback,
            updates_tx,
            session_locks: Mutex::new(SessionLocks::new()),
            recent: Mutex::new(VecDeque::with_capacity(recent_cap)),
            recent_cap: recent_cap.max(1),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn updates(&self) -> broadcast::Receiver<Update> {
        self.updates_tx.subscribe()
    }

    /// Persist one event: durable write + relationship effects in one
    /// transaction, then cache mirror, then broadcast.
    #[instrument(skip(self, event), fields(session_id = %event.session_id, event_type = %event.hook_event_type))]
    pub async fn record(&self, event: HookEvent) -> Result<EventRow, PipelineError> {
        event.validate()?;
        let timestamp = event.timestamp.unwrap_or_else(now_ms);

        let lock = self.session_locks.lock().get(event.session_id.as_str());
        let _guard = lock.lock().await;

        let engine = &self.engine;
        let (row, outcome) = self.db.with_tx(|conn| {
            let row = store_events::insert_tx(conn, &event, timestamp)?;
            let outcome = engine.apply(conn, &row)?;
            Ok((row, outcome))
        })?;

        // Cache tier unavailability is never fatal from here on.
        self.mirror(&row, &outcome.touched).await;

        drop(_guard);

        let _ = self.updates_tx.send(Update::Event(row.clone()));
        for update in outcome.updates {
            let _ = self.updates_tx.send(update);
        }

        Ok(row)
    }

    /// Mirror the event and touched session aggregates into the cache
    /// tier. While disconnected, everything routes straight to the
    /// fallback queue; a mid-mirror failure queues the failed op and the
    /// rest of the batch to preserve order.
    async fn mirror(&self, row: &EventRow, touched: &[SessionRow]) {
        let mut ops: Vec<(String, String)> = Vec::with_capacity(touched.len() + 2);

        match serde_json::to_string(row) {
            Ok(json) => ops.push((tier::event_key(row.id), json)),
            Err(e) => warn!(error = %e, "failed to serialize event for cache"),
        }
        if let Some(json) = self.push_recent(row) {
            ops.push((tier::RECENT_EVENTS_KEY.to_string(), json));
        }
        for session in touched {
            match serde_json::to_string(session) {
                Ok(json) => ops.push((tier::session_key(session.session_id.as_str()), json)),
                Err(e) => warn!(error = %e, "failed to serialize session for cache"),
            }
        }

        if !self.monitor.is_connected() {
            self.enqueue_ops(&ops);
            return;
        }

        let mut failed_at = None;
        for (i, (key, value)) in ops.iter().enumerate() {
            match self.cache.set(key, value).await {
                Ok(()) => self.monitor.record_success(),
                Err(e) => {
                    warn!(key = %key, error = %e, "cache write failed, routing to fallback queue");
                    self.monitor.record_failure(&e.to_string());
                    failed_at = Some(i);
                    break;
                }
            }
        }

        if let Some(i) = failed_at {
            self.enqueue_ops(&ops[i..]);
            return;
        }

        // Cross-instance fan-out; ephemeral, so never queued.
        if let Ok(json) = serde_json::to_string(row) {
            if let Err(e) = self.cache.publish(tier::EVENTS_CHANNEL, &json).await {
                self.monitor.record_failure(&e.to_string());
            }
        }
    }

    fn enqueue_ops(&self, ops: &[(String, String)]) {
        for (key, value) in ops {
            if let Err(e) = self.fallback.enqueue("set", key, value) {
                // Both tiers down; the durable store still has the event.
                warn!(key = %key, error = %e, "failed to enqueue fallback operation");
            }
        }
    }

    /// Maintain the rolling recent-events window and return its JSON
    /// form for mirroring.
    fn push_recent(&self, row: &EventRow) -> Option<String> {
        let mut recent = self.recent.lock();
        if recent.len() == self.recent_cap {
            recent.pop_front();
        }
        recent.push_back(row.clone());
        serde_json::to_string(&recent.iter().collect::<Vec<_>>()).ok()
    }
}
