use async_trait::async_trait;

use crate::error::CacheError;

/// Key for a mirrored event.
pub fn event_key(id: i64) -> String {
    format!("event:{id}")
}

/// Key for a mirrored session aggregate.
pub fn session_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Key holding the rolling window of recent events (JSON array).
pub const RECENT_EVENTS_KEY: &str = "events:recent";

/// Pub/sub channel for cross-instance fan-out.
pub const EVENTS_CHANNEL: &str = "argus:events";

/// The low-latency read-acceleration store. All value writes are
/// last-write-wins SETs so that fallback replay stays idempotent.
/// Implementations must bound every round trip with their configured
/// timeout — a hung backend surfaces as `CacheError::Timeout`, never as
/// an unbounded await.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Lightweight round trip used by the connectivity monitor.
    async fn ping(&self) -> Result<(), CacheError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Fire-and-forget fan-out to other instances. Not queued on
    /// failure: pub/sub delivery is ephemeral by design.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(event_key(42), "event:42");
        assert_eq!(session_key("abc"), "session:abc");
    }
}
