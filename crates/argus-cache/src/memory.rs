use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::CacheError;
use crate::tier::CacheTier;

/// In-memory cache tier used in tests and by deployments that run
/// without Redis. Supports failure injection so outage paths can be
/// exercised deterministically.
#[derive(Default)]
pub struct MemoryTier {
    values: DashMap<String, String>,
    published: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
    op_count: AtomicU64,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the tier into (or out of) simulated-outage mode.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    /// Total operations attempted, including failed ones.
    pub fn op_count(&self) -> u64 {
        self.op_count.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), CacheError> {
        self.op_count.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(CacheError::Connection("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    async fn ping(&self) -> Result<(), CacheError> {
        self.check()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.check()?;
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.values.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError> {
        self.check()?;
        self.published
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

/// A tier that always times out, for exercising the timeout path.
pub struct HungTier;

#[async_trait]
impl CacheTier for HungTier {
    async fn ping(&self) -> Result<(), CacheError> {
        Err(CacheError::Timeout(Duration::from_millis(1)))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), CacheError> {
        Err(CacheError::Timeout(Duration::from_millis(1)))
    }

    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Timeout(Duration::from_millis(1)))
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(CacheError::Timeout(Duration::from_millis(1)))
    }

    async fn publish(&self, _channel: &str, _message: &str) -> Result<(), CacheError> {
        Err(CacheError::Timeout(Duration::from_millis(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete() {
        let tier = MemoryTier::new();
        tier.set("k", "v").await.unwrap();
        assert_eq!(tier.get("k").await.unwrap().as_deref(), Some("v"));
        tier.delete("k").await.unwrap();
        assert_eq!(tier.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_is_last_write_wins() {
        let tier = MemoryTier::new();
        tier.set("k", "v1").await.unwrap();
        tier.set("k", "v2").await.unwrap();
        assert_eq!(tier.value("k").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn failure_injection() {
        let tier = MemoryTier::new();
        tier.set_failing(true);
        assert!(tier.ping().await.is_err());
        assert!(tier.set("k", "v").await.is_err());
        assert!(tier.is_empty());

        tier.set_failing(false);
        assert!(tier.ping().await.is_ok());
    }

    #[tokio::test]
    async fn publish_records_messages() {
        let tier = MemoryTier::new();
        tier.publish("ch", "hello").await.unwrap();
        assert_eq!(tier.published(), vec![("ch".to_string(), "hello".to_string())]);
    }
}
