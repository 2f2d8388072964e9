pub mod error;
pub mod fallback;
pub mod memory;
pub mod monitor;
pub mod redis_tier;
pub mod sync;
pub mod tier;

pub use error::CacheError;
pub use fallback::{FallbackQueue, QueuedOp};
pub use memory::MemoryTier;
pub use monitor::{ConnectivityMonitor, OperatingMode};
pub use redis_tier::RedisTier;
pub use sync::{FallbackSyncService, SyncConfig, SyncStats};
pub use tier::CacheTier;
