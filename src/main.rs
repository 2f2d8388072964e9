use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast;

use argus_cache::monitor::ConnectivityMonitor;
use argus_cache::sync::{FallbackSyncService, SyncConfig};
use argus_cache::tier::CacheTier;
use argus_cache::{FallbackQueue, MemoryTier, RedisTier};
use argus_engine::sweeper::TimeoutSweeper;
use argus_engine::IngestPipeline;
use argus_server::{ServerConfig, ServerDeps};
use argus_store::Database;

/// Multi-agent observability server: ingests agent hook events,
/// reconstructs session hierarchies, and streams live updates.
#[derive(Parser, Debug)]
#[command(name = "argus", version)]
struct Args {
    /// HTTP listen port
    #[arg(long, env = "ARGUS_PORT", default_value_t = 4000)]
    port: u16,

    /// SQLite database path
    #[arg(long, env = "ARGUS_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Redis URL for the cache tier; omit to run with the in-memory tier
    #[arg(long, env = "ARGUS_REDIS_URL")]
    redis_url: Option<String>,

    /// Disable the durable fallback queue (cache failures are then only logged)
    #[arg(long, env = "ARGUS_DISABLE_FALLBACK")]
    disable_fallback: bool,

    /// Directory for fallback queue storage
    #[arg(long, env = "ARGUS_FALLBACK_DIR")]
    fallback_dir: Option<PathBuf>,

    /// Cache connection/operation timeout in milliseconds
    #[arg(long, env = "ARGUS_CACHE_TIMEOUT_MS", default_value_t = 2000)]
    cache_timeout_ms: u64,

    /// Consecutive probe failures before entering fallback mode
    #[arg(long, env = "ARGUS_FAILURE_THRESHOLD", default_value_t = 3)]
    failure_threshold: u32,

    /// Connectivity probe interval in seconds
    #[arg(long, env = "ARGUS_PROBE_INTERVAL_SECS", default_value_t = 10)]
    probe_interval_secs: u64,

    /// Fallback sync interval in seconds
    #[arg(long, env = "ARGUS_SYNC_INTERVAL_SECS", default_value_t = 30)]
    sync_interval_secs: u64,

    /// Fallback sync batch size
    #[arg(long, env = "ARGUS_SYNC_BATCH_SIZE", default_value_t = 50)]
    sync_batch_size: u32,

    /// Replay attempts before a queued operation is dropped
    #[arg(long, env = "ARGUS_SYNC_MAX_RETRIES", default_value_t = 5)]
    sync_max_retries: u32,

    /// Mark active sessions timed out after this many idle seconds (0 disables)
    #[arg(long, env = "ARGUS_SESSION_IDLE_SECS", default_value_t = 1800)]
    session_idle_secs: u64,

    /// Number of recent events sent to new stream subscribers
    #[arg(long, env = "ARGUS_BACKLOG_SIZE", default_value_t = 100)]
    backlog_size: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!("starting argus observability server");

    let data_dir = args
        .db_path
        .as_ref()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| dirs_home().join(".argus"));

    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| data_dir.join("events.db"));
    let db = Database::open(&db_path).expect("failed to open database");

    let cache_timeout = Duration::from_millis(args.cache_timeout_ms);
    let cache: Arc<dyn CacheTier> = match &args.redis_url {
        Some(url) => Arc::new(RedisTier::new(url, cache_timeout).expect("invalid redis url")),
        None => {
            tracing::warn!("no redis url configured, using in-memory cache tier");
            Arc::new(MemoryTier::new())
        }
    };

    let monitor = Arc::new(ConnectivityMonitor::new(
        Arc::clone(&cache),
        args.failure_threshold,
    ));
    let _probe = monitor.spawn_probe_loop(Duration::from_secs(args.probe_interval_secs.max(1)));

    let fallback_dir = args
        .fallback_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("fallback"));
    let fallback = if args.disable_fallback {
        tracing::warn!("fallback queue disabled; cache failures will not be replayed");
        Arc::new(FallbackQueue::in_memory().expect("failed to create fallback queue"))
    } else {
        Arc::new(FallbackQueue::open(&fallback_dir).expect("failed to open fallback queue"))
    };

    let sync = Arc::new(FallbackSyncService::new(
        Arc::clone(&fallback),
        Arc::clone(&cache),
        Arc::clone(&monitor),
        SyncConfig {
            interval_secs: args.sync_interval_secs,
            batch_size: args.sync_batch_size,
            max_retries: args.sync_max_retries,
        },
    ));
    let _sync_task = sync.spawn();

    let (updates_tx, _) = broadcast::channel(1024);
    let pipeline = Arc::new(IngestPipeline::new(
        db.clone(),
        Arc::clone(&cache),
        Arc::clone(&monitor),
        Arc::clone(&fallback),
        updates_tx.clone(),
        args.backlog_size as usize,
    ));

    let sweeper = TimeoutSweeper::new(
        db.clone(),
        updates_tx,
        Duration::from_secs(args.session_idle_secs),
    );
    let _sweeper_task = sweeper.spawn(Duration::from_secs(60));

    let config = ServerConfig {
        port: args.port,
        backlog_size: args.backlog_size,
        ..Default::default()
    };
    let deps = ServerDeps {
        pipeline,
        db,
        cache,
        monitor,
        fallback,
        sync,
    };

    let handle = argus_server::start(config, deps)
        .await
        .expect("failed to start server");
    tracing::info!(port = handle.port, "argus ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
