use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use argus_core::time::now_ms;

use crate::tier::CacheTier;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Connected,
    Disconnected,
}

/// Snapshot of monitor state for the status endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct MonitorSnapshot {
    pub mode: OperatingMode,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_success_ms: Option<i64>,
    pub last_error: Option<String>,
}

struct MonitorState {
    consecutive_failures: u32,
    last_success_ms: Option<i64>,
    last_error: Option<String>,
}

/// Two-state connectivity tracker for the cache tier.
///
/// Hysteresis: it takes `failure_threshold` consecutive failures to flip
/// to disconnected, but a single success flips back. Ingest-path cache
/// errors feed `record_failure` as on-demand signals between probes.
pub struct ConnectivityMonitor {
    tier: Arc<dyn CacheTier>,
    state: Mutex<MonitorState>,
    connected: AtomicBool,
    failure_threshold: u32,
    reconnected: Notify,
}

impl ConnectivityMonitor {
    pub fn new(tier: Arc<dyn CacheTier>, failure_threshold: u32) -> Self {
        Self {
            tier,
            state: Mutex::new(MonitorState {
                consecutive_failures: 0,
                last_success_ms: None,
                last_error: None,
            }),
            // Optimistic until proven otherwise; the first failed write
            // or probe starts the failure count.
            connected: AtomicBool::new(true),
            failure_threshold: failure_threshold.max(1),
            reconnected: Notify::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> OperatingMode {
        if self.is_connected() {
            OperatingMode::Connected
        } else {
            OperatingMode::Disconnected
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let state = self.state.lock();
        MonitorSnapshot {
            mode: self.mode(),
            consecutive_failures: state.consecutive_failures,
            failure_threshold: self.failure_threshold,
            last_success_ms: state.last_success_ms,
            last_error: state.last_error.clone(),
        }
    }

    /// Wait for the next disconnected→connected transition.
    pub async fn wait_reconnected(&self) {
        self.reconnected.notified().await;
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.last_success_ms = Some(now_ms());
        state.last_error = None;
        let was_disconnected = !self.connected.swap(true, Ordering::SeqCst);
        drop(state);

        if was_disconnected {
            info!("cache tier reachable again, leaving fallback mode");
            self.reconnected.notify_waiters();
        }
    }

    pub fn record_failure(&self, error: &str) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error = Some(error.to_string());
        let failures = state.consecutive_failures;
        drop(state);

        if failures >= self.failure_threshold && self.connected.swap(false, Ordering::SeqCst) {
            warn!(failures, "cache tier unreachable, entering fallback mode");
        }
    }

    /// Run one probe round trip and fold the result into the state.
    pub async fn probe_now(&self) -> bool {
        match self.tier.ping().await {
            Ok(()) => {
                self.record_success();
                true
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                false
            }
        }
    }

    /// Spawn the periodic probe loop.
    pub fn spawn_probe_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                monitor.probe_now().await;
            }
        })
    }
}
