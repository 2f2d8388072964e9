use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use argus_core::ids::SessionId;
use argus_core::session::{SessionStatus, SessionType};
use argus_core::time::now_rfc3339;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRow {
    pub session_id: SessionId,
    pub source_app: String,
    pub session_type: SessionType,
    pub parent_session_id: Option<SessionId>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub duration_ms: Option<i64>,
    pub status: SessionStatus,
    pub agent_count: i64,
    pub total_tokens: i64,
    pub session_metadata: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get(&self, session_id: &SessionId) -> Result<SessionRow, StoreError> {
        self.db.with_conn(|conn| get_tx(conn, session_id))
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn ensure(
        &self,
        session_id: &SessionId,
        source_app: &str,
        session_type: SessionType,
        parent_session_id: Option<&SessionId>,
        start_time: i64,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            ensure_tx(conn, session_id, source_app, session_type, parent_session_id, start_time)
        })
    }

    /// All sessions currently in `active` status.
    #[instrument(skip(self))]
    pub fn list_active(&self) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SESSION} WHERE status = 'active' ORDER BY start_time ASC"
            ))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    /// Active sessions whose last touch is older than the cutoff
    /// (RFC 3339 compare; all rows are written in UTC).
    #[instrument(skip(self))]
    pub fn list_stale_active(&self, cutoff_rfc3339: &str) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SESSION} WHERE status = 'active' AND updated_at < ?1"
            ))?;
            let mut rows = stmt.query([cutoff_rfc3339])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %session_id, status = %status))]
    pub fn update_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| update_status_tx(conn, session_id, status))
    }
}

const SELECT_SESSION: &str = "SELECT session_id, source_app, session_type, parent_session_id, \
     start_time, end_time, duration_ms, status, agent_count, total_tokens, session_metadata, \
     created_at, updated_at FROM sessions";

pub fn get_tx(conn: &Connection, session_id: &SessionId) -> Result<SessionRow, StoreError> {
    let mut stmt = conn.prepare(&format!("{SELECT_SESSION} WHERE session_id = ?1"))?;
    let mut rows = stmt.query([session_id.as_str()])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {session_id}"))),
    }
}

/// Create the session row if it does not exist yet. Returns true when a
/// row was created. An existing row is only touched (updated_at), except
/// that a missing parent link is filled in when one becomes known.
pub fn ensure_tx(
    conn: &Connection,
    session_id: &SessionId,
    source_app: &str,
    session_type: SessionType,
    parent_session_id: Option<&SessionId>,
    start_time: i64,
) -> Result<bool, StoreError> {
    let now = now_rfc3339();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO sessions (session_id, source_app, session_type, \
         parent_session_id, start_time, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6)",
        rusqlite::params![
            session_id.as_str(),
            source_app,
            session_type.to_string(),
            parent_session_id.map(|p| p.as_str()),
            start_time,
            now,
        ],
    )?;

    if inserted == 0 {
        conn.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
            rusqlite::params![now, session_id.as_str()],
        )?;
        if let Some(parent) = parent_session_id {
            set_parent_tx(conn, session_id, parent)?;
        }
    }

    Ok(inserted > 0)
}

/// Fill in the parent link (and flip main → subagent) when the parent was
/// not known at creation time. No-op when a parent is already recorded.
pub fn set_parent_tx(
    conn: &Connection,
    session_id: &SessionId,
    parent_session_id: &SessionId,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET parent_session_id = ?1, \
         session_type = CASE WHEN session_type = 'main' THEN 'subagent' ELSE session_type END, \
         updated_at = ?2
         WHERE session_id = ?3 AND parent_session_id IS NULL",
        rusqlite::params![parent_session_id.as_str(), now_rfc3339(), session_id.as_str()],
    )?;
    Ok(())
}

/// Override the session type when a spawn reveals a more specific one
/// (continuation, isolated).
pub fn set_type_tx(
    conn: &Connection,
    session_id: &SessionId,
    session_type: SessionType,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET session_type = ?1, updated_at = ?2 WHERE session_id = ?3",
        rusqlite::params![session_type.to_string(), now_rfc3339(), session_id.as_str()],
    )?;
    Ok(())
}

/// Status transitions are monotonic: the update only applies while the
/// session is still active. Returns true when the row changed.
pub fn update_status_tx(
    conn: &Connection,
    session_id: &SessionId,
    status: SessionStatus,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE sessions SET status = ?1, updated_at = ?2 \
         WHERE session_id = ?3 AND status = 'active'",
        rusqlite::params![status.to_string(), now_rfc3339(), session_id.as_str()],
    )?;
    Ok(changed > 0)
}

pub fn set_end_tx(
    conn: &Connection,
    session_id: &SessionId,
    end_time: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET end_time = ?1, \
         duration_ms = CASE WHEN ?1 >= start_time THEN ?1 - start_time ELSE NULL END, \
         updated_at = ?2
         WHERE session_id = ?3 AND end_time IS NULL",
        rusqlite::params![end_time, now_rfc3339(), session_id.as_str()],
    )?;
    Ok(())
}

pub fn increment_agent_count_tx(
    conn: &Connection,
    session_id: &SessionId,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET agent_count = agent_count + 1, updated_at = ?1 WHERE session_id = ?2",
        rusqlite::params![now_rfc3339(), session_id.as_str()],
    )?;
    Ok(())
}

pub fn add_tokens_tx(
    conn: &Connection,
    session_id: &SessionId,
    tokens: i64,
) -> Result<(), StoreError> {
    if tokens <= 0 {
        return Ok(());
    }
    conn.execute(
        "UPDATE sessions SET total_tokens = total_tokens + ?1, updated_at = ?2 WHERE session_id = ?3",
        rusqlite::params![tokens, now_rfc3339(), session_id.as_str()],
    )?;
    Ok(())
}

/// Merge a key into session_metadata, preserving other keys.
pub fn merge_metadata_tx(
    conn: &Connection,
    session_id: &SessionId,
    key: &str,
    value: serde_json::Value,
) -> Result<(), StoreError> {
    let current: Option<String> = conn
        .query_row(
            "SELECT session_metadata FROM sessions WHERE session_id = ?1",
            [session_id.as_str()],
            |row| row.get(0),
        )
        .map_err(|_| StoreError::NotFound(format!("session {session_id}")))?;

    let mut metadata = match current.as_deref() {
        Some(raw) => row_helpers::parse_json(raw, "sessions", "session_metadata")?,
        None => serde_json::json!({}),
    };
    if !metadata.is_object() {
        metadata = serde_json::json!({});
    }
    metadata[key] = value;

    conn.execute(
        "UPDATE sessions SET session_metadata = ?1, updated_at = ?2 WHERE session_id = ?3",
        rusqlite::params![serde_json::to_string(&metadata)?, now_rfc3339(), session_id.as_str()],
    )?;
    Ok(())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRow, StoreError> {
    let type_str: String = row_helpers::get(row, 2, "sessions", "session_type")?;
    let status_str: String = row_helpers::get(row, 7, "sessions", "status")?;
    let metadata = row_helpers::parse_json_opt(
        row_helpers::get_opt::<String>(row, 10, "sessions", "session_metadata")?,
        "sessions",
        "session_metadata",
    )?;

    Ok(SessionRow {
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "session_id")?),
        source_app: row_helpers::get(row, 1, "sessions", "source_app")?,
        session_type: row_helpers::parse_enum(&type_str, "sessions", "session_type")?,
        parent_session_id: row_helpers::get_opt::<String>(row, 3, "sessions", "parent_session_id")?
            .map(SessionId::from_raw),
        start_time: row_helpers::get(row, 4, "sessions", "start_time")?,
        end_time: row_helpers::get_opt(row, 5, "sessions", "end_time")?,
        duration_ms: row_helpers::get_opt(row, 6, "sessions", "duration_ms")?,
        status: row_helpers::parse_enum(&status_str, "sessions", "status")?,
        agent_count: row_helpers::get(row, 8, "sessions", "agent_count")?,
        total_tokens: row_helpers::get(row, 9, "sessions", "total_tokens")?,
        session_metadata: metadata,
        created_at: row_helpers::get(row, 11, "sessions", "created_at")?,
        updated_at: row_helpers::get(row, 12, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    #[test]
    fn ensure_creates_once() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let created = repo.ensure(&sid("s1"), "app", SessionType::Main, None, 100).unwrap();
        assert!(created);
        let created = repo.ensure(&sid("s1"), "app", SessionType::Main, None, 100).unwrap();
        assert!(!created);

        let session = repo.get(&sid("s1")).unwrap();
        assert_eq!(session.session_type, SessionType::Main);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.start_time, 100);
        assert_eq!(session.agent_count, 0);
    }

    #[test]
    fn ensure_backfills_parent() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("child"), "app", SessionType::Main, None, 100).unwrap();

        // Parent becomes known on a later event.
        repo.ensure(&sid("child"), "app", SessionType::Subagent, Some(&sid("parent")), 100)
            .unwrap();

        let session = repo.get(&sid("child")).unwrap();
        assert_eq!(session.parent_session_id.as_ref().unwrap().as_str(), "parent");
        assert_eq!(session.session_type, SessionType::Subagent);
    }

    #[test]
    fn backfill_does_not_overwrite_existing_parent() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("child"), "app", SessionType::Subagent, Some(&sid("p1")), 100)
            .unwrap();
        repo.ensure(&sid("child"), "app", SessionType::Subagent, Some(&sid("p2")), 100)
            .unwrap();

        let session = repo.get(&sid("child")).unwrap();
        assert_eq!(session.parent_session_id.as_ref().unwrap().as_str(), "p1");
    }

    #[test]
    fn terminal_status_never_reverts() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("s1"), "app", SessionType::Subagent, None, 100).unwrap();

        assert!(repo.update_status(&sid("s1"), SessionStatus::Completed).unwrap());
        // Already terminal; further transitions are no-ops.
        assert!(!repo.update_status(&sid("s1"), SessionStatus::Failed).unwrap());

        let session = repo.get(&sid("s1")).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[test]
    fn end_time_sets_duration() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("s1"), "app", SessionType::Subagent, None, 1000).unwrap();
        db.with_conn(|conn| set_end_tx(conn, &sid("s1"), 4500)).unwrap();

        let session = repo.get(&sid("s1")).unwrap();
        assert_eq!(session.end_time, Some(4500));
        assert_eq!(session.duration_ms, Some(3500));
    }

    #[test]
    fn agent_count_and_tokens_accumulate() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("s1"), "app", SessionType::Main, None, 100).unwrap();
        db.with_conn(|conn| {
            increment_agent_count_tx(conn, &sid("s1"))?;
            increment_agent_count_tx(conn, &sid("s1"))?;
            add_tokens_tx(conn, &sid("s1"), 1200)?;
            add_tokens_tx(conn, &sid("s1"), 300)?;
            add_tokens_tx(conn, &sid("s1"), 0)?;
            Ok(())
        })
        .unwrap();

        let session = repo.get(&sid("s1")).unwrap();
        assert_eq!(session.agent_count, 2);
        assert_eq!(session.total_tokens, 1500);
    }

    #[test]
    fn metadata_merges_keys() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("s1"), "app", SessionType::Main, None, 100).unwrap();
        db.with_conn(|conn| {
            merge_metadata_tx(conn, &sid("s1"), "prompt", json!("fix the bug"))?;
            merge_metadata_tx(conn, &sid("s1"), "agent_name", json!("debugger"))?;
            Ok(())
        })
        .unwrap();

        let session = repo.get(&sid("s1")).unwrap();
        let metadata = session.session_metadata.unwrap();
        assert_eq!(metadata["prompt"], "fix the bug");
        assert_eq!(metadata["agent_name"], "debugger");
    }

    #[test]
    fn list_active_excludes_terminal() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("a"), "app", SessionType::Main, None, 1).unwrap();
        repo.ensure(&sid("b"), "app", SessionType::Main, None, 2).unwrap();
        repo.update_status(&sid("a"), SessionStatus::Completed).unwrap();

        let active = repo.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id.as_str(), "b");
    }

    #[test]
    fn stale_active_query_uses_cutoff() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        repo.ensure(&sid("old"), "app", SessionType::Main, None, 1).unwrap();

        // Everything is fresher than a past cutoff.
        let stale = repo.list_stale_active("2000-01-01T00:00:00+00:00").unwrap();
        assert!(stale.is_empty());

        // Everything is staler than a future cutoff.
        let stale = repo.list_stale_active("2100-01-01T00:00:00+00:00").unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[test]
    fn invalid_status_returns_corrupt_row() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, source_app, status, start_time, created_at, updated_at)
                 VALUES ('s1', 'app', 'BOGUS', 1, '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = SessionRepo::new(db);
        assert!(matches!(repo.get(&sid("s1")), Err(StoreError::CorruptRow { .. })));
    }
}
