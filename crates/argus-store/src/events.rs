use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use argus_core::events::{HookEvent, HookEventType};
use argus_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A persisted event row. Identifier and timestamp are store-assigned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRow {
    pub id: i64,
    pub source_app: String,
    pub session_id: SessionId,
    pub hook_event_type: HookEventType,
    pub payload: serde_json::Value,
    pub chat: Option<serde_json::Value>,
    pub summary: Option<String>,
    pub timestamp: i64,
    pub parent_session_id: Option<SessionId>,
    pub session_depth: i64,
    pub wave_id: Option<String>,
    pub delegation_context: Option<serde_json::Value>,
    pub correlation_id: Option<String>,
}

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an event, assigning id and (when absent) timestamp.
    #[instrument(skip(self, event), fields(session_id = %event.session_id, event_type = %event.hook_event_type))]
    pub fn insert(&self, event: &HookEvent, timestamp: i64) -> Result<EventRow, StoreError> {
        self.db.with_conn(|conn| insert_tx(conn, event, timestamp))
    }

    #[instrument(skip(self))]
    pub fn get(&self, id: i64) -> Result<EventRow, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_EVENT} WHERE id = ?1"))?;
            let mut rows = stmt.query([id])?;
            match rows.next()? {
                Some(row) => row_to_event(row),
                None => Err(StoreError::NotFound(format!("event {id}"))),
            }
        })
    }

    /// Most recent events across all sessions, oldest first (for the
    /// `initial` backlog sent to new subscribers).
    #[instrument(skip(self))]
    pub fn list_recent(&self, limit: u32) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_EVENT} ORDER BY id DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            results.reverse();
            Ok(results)
        })
    }

    /// Events for one session in insertion order.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_for_session(
        &self,
        session_id: &SessionId,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<Vec<EventRow>, StoreError> {
        self.db.with_conn(|conn| {
            let limit = limit.unwrap_or(1000);
            let offset = offset.unwrap_or(0);
            let mut stmt = conn.prepare(&format!(
                "{SELECT_EVENT} WHERE session_id = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3"
            ))?;
            let mut rows = stmt.query(rusqlite::params![session_id.as_str(), limit, offset])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self))]
    pub fn count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
        })
    }
}

const SELECT_EVENT: &str = "SELECT id, source_app, session_id, hook_event_type, payload, chat, \
     summary, timestamp, parent_session_id, session_depth, wave_id, delegation_context, \
     correlation_id FROM events";

/// Transaction-scoped insert, used by the ingest pipeline so the event
/// and its relationship effects commit together.
pub fn insert_tx(
    conn: &Connection,
    event: &HookEvent,
    timestamp: i64,
) -> Result<EventRow, StoreError> {
    conn.execute(
        "INSERT INTO events (source_app, session_id, hook_event_type, payload, chat, summary, \
         timestamp, parent_session_id, session_depth, wave_id, delegation_context, correlation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        rusqlite::params![
            event.source_app,
            event.session_id.as_str(),
            event.hook_event_type.as_str(),
            serde_json::to_string(&event.payload)?,
            event
                .chat
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            event.summary,
            timestamp,
            event.parent_session_id.as_ref().map(|p| p.as_str()),
            event.session_depth.unwrap_or(0),
            event.wave_id,
            event
                .delegation_context
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            event.correlation_id,
        ],
    )?;

    let id = conn.last_insert_rowid();

    Ok(EventRow {
        id,
        source_app: event.source_app.clone(),
        session_id: event.session_id.clone(),
        hook_event_type: event.hook_event_type,
        payload: event.payload.clone(),
        chat: event.chat.clone(),
        summary: event.summary.clone(),
        timestamp,
        parent_session_id: event.parent_session_id.clone(),
        session_depth: event.session_depth.unwrap_or(0),
        wave_id: event.wave_id.clone(),
        delegation_context: event.delegation_context.clone(),
        correlation_id: event.correlation_id.clone(),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    let payload_str: String = row_helpers::get(row, 4, "events", "payload")?;
    let payload = row_helpers::parse_json(&payload_str, "events", "payload")?;
    let chat = row_helpers::parse_json_opt(
        row_helpers::get_opt::<String>(row, 5, "events", "chat")?,
        "events",
        "chat",
    )?;
    let delegation_context = row_helpers::parse_json_opt(
        row_helpers::get_opt::<String>(row, 11, "events", "delegation_context")?,
        "events",
        "delegation_context",
    )?;
    let type_str: String = row_helpers::get(row, 3, "events", "hook_event_type")?;

    Ok(EventRow {
        id: row_helpers::get(row, 0, "events", "id")?,
        source_app: row_helpers::get(row, 1, "events", "source_app")?,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 2, "events", "session_id")?),
        hook_event_type: row_helpers::parse_enum(&type_str, "events", "hook_event_type")?,
        payload,
        chat,
        summary: row_helpers::get_opt(row, 6, "events", "summary")?,
        timestamp: row_helpers::get(row, 7, "events", "timestamp")?,
        parent_session_id: row_helpers::get_opt::<String>(row, 8, "events", "parent_session_id")?
            .map(SessionId::from_raw),
        session_depth: row_helpers::get(row, 9, "events", "session_depth")?,
        wave_id: row_helpers::get_opt(row, 10, "events", "wave_id")?,
        delegation_context,
        correlation_id: row_helpers::get_opt(row, 12, "events", "correlation_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::events::HookEventType;
    use serde_json::json;

    fn event(session: &str, t: HookEventType) -> HookEvent {
        HookEvent::new("test-app", SessionId::from_raw(session), t, json!({"k": "v"}))
    }

    #[test]
    fn insert_assigns_incrementing_ids() {
        let db = Database::in_memory().unwrap();
        let repo = EventRepo::new(db);
        let e1 = repo.insert(&event("s1", HookEventType::SessionStart), 100).unwrap();
        let e2 = repo.insert(&event("s1", HookEventType::Stop), 200).unwrap();
        assert!(e2.id > e1.id);
    }

    #[test]
    fn get_event_roundtrip() {
        let db = Database::in_memory().unwrap();
        let repo = EventRepo::new(db);
        let mut e = event("s1", HookEventType::PreToolUse);
        e.correlation_id = Some("corr-1".into());
        e.wave_id = Some("wave-1".into());
        e.chat = Some(json!([{"role": "user"}]));
        let inserted = repo.insert(&e, 1234).unwrap();

        let fetched = repo.get(inserted.id).unwrap();
        assert_eq!(fetched.session_id.as_str(), "s1");
        assert_eq!(fetched.hook_event_type, HookEventType::PreToolUse);
        assert_eq!(fetched.timestamp, 1234);
        assert_eq!(fetched.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(fetched.wave_id.as_deref(), Some("wave-1"));
        assert_eq!(fetched.chat, Some(json!([{"role": "user"}])));
        assert_eq!(fetched.payload["k"], "v");
    }

    #[test]
    fn get_missing_event_fails() {
        let db = Database::in_memory().unwrap();
        let repo = EventRepo::new(db);
        assert!(matches!(repo.get(42), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_recent_returns_newest_oldest_first() {
        let db = Database::in_memory().unwrap();
        let repo = EventRepo::new(db);
        for i in 0..5 {
            repo.insert(&event(&format!("s{i}"), HookEventType::Notification), i)
                .unwrap();
        }

        let recent = repo.list_recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        // Oldest of the three first, newest last.
        assert!(recent[0].id < recent[1].id);
        assert!(recent[1].id < recent[2].id);
        assert_eq!(recent[2].session_id.as_str(), "s4");
    }

    #[test]
    fn list_for_session_preserves_insertion_order() {
        let db = Database::in_memory().unwrap();
        let repo = EventRepo::new(db);
        // Out-of-order timestamps; per-session order is insertion order.
        repo.insert(&event("s1", HookEventType::SessionStart), 300).unwrap();
        repo.insert(&event("s1", HookEventType::PreToolUse), 100).unwrap();
        repo.insert(&event("s2", HookEventType::SessionStart), 50).unwrap();
        repo.insert(&event("s1", HookEventType::Stop), 200).unwrap();

        let events = repo.list_for_session(&SessionId::from_raw("s1"), None, None).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].hook_event_type, HookEventType::SessionStart);
        assert_eq!(events[1].hook_event_type, HookEventType::PreToolUse);
        assert_eq!(events[2].hook_event_type, HookEventType::Stop);
    }

    #[test]
    fn count_events() {
        let db = Database::in_memory().unwrap();
        let repo = EventRepo::new(db);
        assert_eq!(repo.count().unwrap(), 0);
        repo.insert(&event("s1", HookEventType::SessionStart), 1).unwrap();
        repo.insert(&event("s1", HookEventType::Stop), 2).unwrap();
        assert_eq!(repo.count().unwrap(), 2);
    }

    #[test]
    fn malformed_payload_returns_error_not_null() {
        let db = Database::in_memory().unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (source_app, session_id, hook_event_type, payload, timestamp)
                 VALUES ('app', 's1', 'Stop', 'not valid json', 1)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let repo = EventRepo::new(db);
        let result = repo.list_for_session(&SessionId::from_raw("s1"), None, None);
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
