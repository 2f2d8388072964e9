use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, instrument};

use argus_core::time::now_ms;

use crate::error::CacheError;

const CREATE_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS fallback_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    op TEXT NOT NULL,
    key TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_fallback_key ON fallback_operations(key);
"#;

const QUEUE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// A queued cache write awaiting replay.
#[derive(Clone, Debug, Serialize)]
pub struct QueuedOp {
    pub id: i64,
    pub op: String,
    pub key: String,
    pub payload: String,
    pub enqueued_at: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Durable on-disk FIFO of cache operations that could not be applied
/// while the cache tier was unreachable. Rowid order doubles as enqueue
/// order, which also preserves per-key ordering.
pub struct FallbackQueue {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl FallbackQueue {
    /// Open (or create) the queue database under the fallback directory.
    pub fn open(dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| CacheError::Queue(format!("create fallback dir: {e}")))?;
        let path = dir.join("fallback.db");
        let conn = Connection::open(&path).map_err(|e| CacheError::Queue(e.to_string()))?;
        conn.execute_batch(QUEUE_PRAGMAS)?;
        conn.execute_batch(CREATE_QUEUE)?;
        info!(path = %path.display(), "fallback queue opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// In-memory queue (for testing).
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(|e| CacheError::Queue(e.to_string()))?;
        conn.execute_batch(CREATE_QUEUE)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self, payload))]
    pub fn enqueue(&self, op: &str, key: &str, payload: &str) -> Result<i64, CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fallback_operations (op, key, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![op, key, payload, now_ms()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest `limit` operations in enqueue order.
    pub fn peek_batch(&self, limit: u32) -> Result<Vec<QueuedOp>, CacheError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, op, key, payload, enqueued_at, attempts, last_error
             FROM fallback_operations ORDER BY id ASC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(QueuedOp {
                id: row.get(0)?,
                op: row.get(1)?,
                key: row.get(2)?,
                payload: row.get(3)?,
                enqueued_at: row.get(4)?,
                attempts: row.get(5)?,
                last_error: row.get(6)?,
            });
        }
        Ok(results)
    }

    /// Remove an operation after confirmed replay (or permanent failure).
    pub fn remove(&self, id: i64) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM fallback_operations WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Record a failed replay attempt.
    pub fn record_attempt(&self, id: i64, error: &str) -> Result<u32, CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE fallback_operations SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
            rusqlite::params![error, id],
        )?;
        let attempts: u32 = conn.query_row(
            "SELECT attempts FROM fallback_operations WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    pub fn depth(&self) -> Result<i64, CacheError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM fallback_operations", [], |row| row.get(0))?)
    }

    /// Inspect queued operations without consuming them.
    pub fn list(&self, limit: u32) -> Result<Vec<QueuedOp>, CacheError> {
        self.peek_batch(limit)
    }

    /// Drop every queued operation. Returns the number purged.
    pub fn purge(&self) -> Result<i64, CacheError> {
        let conn = self.conn.lock();
        let purged = conn.execute("DELETE FROM fallback_operations", [])?;
        Ok(purged as i64)
    }
}
