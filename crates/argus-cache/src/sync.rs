use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use argus_core::time::now_ms;

use crate::error::CacheError;
use crate::fallback::FallbackQueue;
use crate::monitor::ConnectivityMonitor;
use crate::tier::CacheTier;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub batch_size: u32,
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 50,
            max_retries: 5,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SyncStats {
    pub total_synced: u64,
    pub total_failed: u64,
    pub permanent_failures: u64,
    pub last_sync_duration_ms: Option<u64>,
    pub last_sync_at_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleResult {
    pub synced: u64,
    pub failed: u64,
    pub permanent: u64,
}

/// Drains the fallback queue back into the cache tier.
///
/// Runs on a fixed interval, immediately on reconnect, and on demand via
/// `drain_all`. Replay is idempotent: every queued op is a last-write-wins
/// SET, so re-running a partially applied batch cannot corrupt state.
pub struct FallbackSyncService {
    queue: Arc<FallbackQueue>,
    tier: Arc<dyn CacheTier>,
    monitor: Arc<ConnectivityMonitor>,
    config: RwLock<SyncConfig>,
    stats: Mutex<SyncStats>,
}

impl FallbackSyncService {
    pub fn new(
        queue: Arc<FallbackQueue>,
        tier: Arc<dyn CacheTier>,
        monitor: Arc<ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            tier,
            monitor,
            config: RwLock::new(config),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub fn config(&self) -> SyncConfig {
        *self.config.read()
    }

    pub fn update_config(&self, config: SyncConfig) {
        info!(
            interval_secs = config.interval_secs,
            batch_size = config.batch_size,
            max_retries = config.max_retries,
            "sync config updated"
        );
        *self.config.write() = config;
    }

    pub fn stats(&self) -> SyncStats {
        *self.stats.lock()
    }

    pub fn queue_depth(&self) -> Result<i64, CacheError> {
        self.queue.depth()
    }

    /// Replay one bounded batch. Successes are removed from the queue;
    /// failures stay queued with an incremented attempt counter, except
    /// ops past the retry ceiling, which are dropped and counted as
    /// permanent failures.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleResult, CacheError> {
        let config = self.config();
        let started = Instant::now();
        let batch = self.queue.peek_batch(config.batch_size)?;
        let mut result = CycleResult::default();

        for op in batch {
            match self.replay(&op.op, &op.key, &op.payload).await {
                Ok(()) => {
                    self.queue.remove(op.id)?;
                    result.synced += 1;
                    self.monitor.record_success();
                }
                Err(e) => {
                    let attempts = self.queue.record_attempt(op.id, &e.to_string())?;
                    self.monitor.record_failure(&e.to_string());
                    if attempts > config.max_retries {
                        error!(
                            id = op.id,
                            key = %op.key,
                            attempts,
                            error = %e,
                            "dropping fallback operation after exceeding retry ceiling"
                        );
                        self.queue.remove(op.id)?;
                        result.permanent += 1;
                    } else {
                        warn!(id = op.id, key = %op.key, attempts, error = %e, "fallback replay failed");
                        result.failed += 1;
                    }
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.total_synced += result.synced;
        stats.total_failed += result.failed;
        stats.permanent_failures += result.permanent;
        stats.last_sync_duration_ms = Some(started.elapsed().as_millis() as u64);
        stats.last_sync_at_ms = Some(now_ms());

        Ok(result)
    }

    /// Drain until the queue is empty or a full cycle makes no progress.
    #[instrument(skip(self))]
    pub async fn drain_all(&self) -> Result<CycleResult, CacheError> {
        let mut total = CycleResult::default();
        loop {
            let cycle = self.run_cycle().await?;
            total.synced += cycle.synced;
            total.failed += cycle.failed;
            total.permanent += cycle.permanent;
            if cycle.synced == 0 && cycle.permanent == 0 {
                break;
            }
            if self.queue.depth()? == 0 {
                break;
            }
        }
        Ok(total)
    }

    async fn replay(&self, op: &str, key: &str, payload: &str) -> Result<(), CacheError> {
        match op {
            "set" => self.tier.set(key, payload).await,
            other => {
                // Unknown op kinds are never retried: they would fail forever.
                Err(CacheError::Operation(format!("unknown fallback op: {other}")))
            }
        }
    }

    /// Spawn the background drain loop: fixed interval plus an immediate
    /// drain on the disconnected→connected transition. Backoff between
    /// cycles doubles (capped) while replays keep failing.
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut failed_cycles: u32 = 0;
            loop {
                let interval = Duration::from_secs(service.config().interval_secs.max(1));
                let delay = backoff_delay(interval, failed_cycles);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = service.monitor.wait_reconnected() => {
                        info!("cache tier reconnected, draining fallback queue");
                        match service.drain_all().await {
                            Ok(result) => info!(synced = result.synced, "reconnect drain finished"),
                            Err(e) => warn!(error = %e, "reconnect drain failed"),
                        }
                        failed_cycles = 0;
                        continue;
                    }
                }

                if !service.monitor.is_connected() {
                    continue;
                }

                match service.run_cycle().await {
                    Ok(result) if result.failed > 0 => {
                        failed_cycles = failed_cycles.saturating_add(1);
                    }
                    Ok(_) => failed_cycles = 0,
                    Err(e) => {
                        warn!(error = %e, "sync cycle failed");
                        failed_cycles = failed_cycles.saturating_add(1);
                    }
                }
            }
        })
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(300);

fn backoff_delay(base: Duration, failed_cycles: u32) -> Duration {
    let shift = failed_cycles.min(4);
    let delay = base.saturating_mul(1u32 << shift);
    delay.min(MAX_BACKOFF.max(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTier;
    use crate::tier::event_key;

    fn setup() -> (Arc<FallbackQueue>, Arc<MemoryTier>, Arc<FallbackSyncService>) {
        let queue = Arc::new(FallbackQueue::in_memory().unwrap());
        let tier = Arc::new(MemoryTier::new());
        let monitor = Arc::new(ConnectivityMonitor::new(tier.clone(), 3));
        let service = Arc::new(FallbackSyncService::new(
            queue.clone(),
            tier.clone(),
            monitor,
            SyncConfig {
                interval_secs: 1,
                batch_size: 10,
                max_retries: 2,
            },
        ));
        (queue, tier, service)
    }

    #[tokio::test]
    async fn cycle_drains_queue_into_tier() {
        let (queue, tier, service) = setup();
        queue.enqueue("set", &event_key(1), "{\"id\":1}").unwrap();
        queue.enqueue("set", &event_key(2), "{\"id\":2}").unwrap();

        let result = service.run_cycle().await.unwrap();
        assert_eq!(result.synced, 2);
        assert_eq!(queue.depth().unwrap(), 0);
        assert_eq!(tier.value("event:1").as_deref(), Some("{\"id\":1}"));
        assert_eq!(tier.value("event:2").as_deref(), Some("{\"id\":2}"));
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let (queue, tier, service) = setup();
        queue.enqueue("set", "session:s1", "{\"status\":\"active\"}").unwrap();
        service.run_cycle().await.unwrap();
        let after_once = tier.value("session:s1");

        // Simulate a crash between replay and dequeue: the same op is
        // queued again and replayed a second time.
        queue.enqueue("set", "session:s1", "{\"status\":\"active\"}").unwrap();
        service.run_cycle().await.unwrap();

        assert_eq!(tier.value("session:s1"), after_once);
    }

    #[tokio::test]
    async fn failed_ops_stay_queued_until_ceiling() {
        let (queue, tier, service) = setup();
        queue.enqueue("set", "k", "v").unwrap();
        tier.set_failing(true);

        // max_retries = 2: attempts 1 and 2 keep the op queued.
        let r1 = service.run_cycle().await.unwrap();
        assert_eq!(r1, CycleResult { synced: 0, failed: 1, permanent: 0 });
        let r2 = service.run_cycle().await.unwrap();
        assert_eq!(r2.failed, 1);
        assert_eq!(queue.depth().unwrap(), 1);

        // Attempt 3 exceeds the ceiling: dropped, logged as permanent.
        let r3 = service.run_cycle().await.unwrap();
        assert_eq!(r3.permanent, 1);
        assert_eq!(queue.depth().unwrap(), 0);
        assert_eq!(service.stats().permanent_failures, 1);
    }

    #[tokio::test]
    async fn drain_all_loops_over_batches() {
        let (queue, tier, service) = setup();
        for i in 0..25 {
            queue.enqueue("set", &event_key(i), &format!("{{\"id\":{i}}}")).unwrap();
        }

        let result = service.drain_all().await.unwrap();
        assert_eq!(result.synced, 25);
        assert_eq!(queue.depth().unwrap(), 0);
        assert_eq!(tier.len(), 25);
    }

    #[tokio::test]
    async fn outage_then_drain_loses_nothing() {
        let (queue, tier, service) = setup();
        // Events written while disconnected all land in the queue.
        for i in 0..10 {
            queue.enqueue("set", &event_key(i), &format!("{{\"n\":{i}}}")).unwrap();
        }
        tier.set_failing(true);
        let result = service.run_cycle().await.unwrap();
        assert_eq!(result.synced, 0);
        assert_eq!(queue.depth().unwrap(), 10);

        // Recovery: every queued event reaches the tier.
        tier.set_failing(false);
        service.drain_all().await.unwrap();
        assert_eq!(queue.depth().unwrap(), 0);
        for i in 0..10 {
            assert_eq!(tier.value(&event_key(i)).as_deref(), Some(format!("{{\"n\":{i}}}").as_str()));
        }
    }

    #[tokio::test]
    async fn unknown_op_goes_permanent() {
        let (queue, _tier, service) = setup();
        queue.enqueue("increment", "k", "1").unwrap();

        let mut permanent = 0;
        for _ in 0..4 {
            permanent += service.run_cycle().await.unwrap().permanent;
        }
        assert_eq!(permanent, 1);
        assert_eq!(queue.depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn stats_track_cycles() {
        let (queue, _tier, service) = setup();
        queue.enqueue("set", "k", "v").unwrap();
        service.run_cycle().await.unwrap();

        let stats = service.stats();
        assert_eq!(stats.total_synced, 1);
        assert!(stats.last_sync_at_ms.is_some());
        assert!(stats.last_sync_duration_ms.is_some());
    }

    #[tokio::test]
    async fn config_update_applies() {
        let (_queue, _tier, service) = setup();
        service.update_config(SyncConfig {
            interval_secs: 5,
            batch_size: 100,
            max_retries: 9,
        });
        let config = service.config();
        assert_eq!(config.interval_secs, 5);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_retries, 9);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, 0), base);
        assert_eq!(backoff_delay(base, 1), base * 2);
        assert_eq!(backoff_delay(base, 4), base * 16);
        // Shift is clamped; very long failure streaks do not overflow.
        assert_eq!(backoff_delay(base, 30), backoff_delay(base, 4));
        assert!(backoff_delay(Duration::from_secs(60), 4) <= Duration::from_secs(300));
    }
}
