/// SQL DDL for the argus event store.
/// WAL mode + foreign keys enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_app TEXT NOT NULL,
    session_id TEXT NOT NULL,
    hook_event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    chat TEXT,
    summary TEXT,
    timestamp INTEGER NOT NULL,
    parent_session_id TEXT,
    session_depth INTEGER NOT NULL DEFAULT 0,
    wave_id TEXT,
    delegation_context TEXT,
    correlation_id TEXT
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    source_app TEXT NOT NULL,
    session_type TEXT NOT NULL DEFAULT 'main',
    parent_session_id TEXT,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    duration_ms INTEGER,
    status TEXT NOT NULL DEFAULT 'active',
    agent_count INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    session_metadata TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_relationships (
    parent_session_id TEXT NOT NULL,
    child_session_id TEXT NOT NULL,
    relationship_type TEXT NOT NULL DEFAULT 'parent_child',
    spawn_reason TEXT NOT NULL DEFAULT 'subagent_delegation',
    delegation_type TEXT,
    spawn_metadata TEXT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER,
    depth_level INTEGER NOT NULL DEFAULT 1,
    session_path TEXT NOT NULL,
    PRIMARY KEY (parent_session_id, child_session_id),
    CHECK (parent_session_id <> child_session_id),
    CHECK (depth_level >= 1)
);

CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id);
CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(hook_event_type);
CREATE INDEX IF NOT EXISTS idx_events_correlation ON events(correlation_id);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);
CREATE INDEX IF NOT EXISTS idx_relationships_parent ON session_relationships(parent_session_id);
CREATE INDEX IF NOT EXISTS idx_relationships_child ON session_relationships(child_session_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
