use serde::Serialize;

use argus_core::events::HookEventType;
use argus_core::ids::SessionId;
use argus_core::session::SessionStatus;
use argus_store::events::EventRow;
use argus_store::relationships::RelationshipRow;

/// State changes fanned out to live subscribers. Serialization already
/// matches the wire envelope `{type, data}`.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Update {
    Event(EventRow),

    SessionSpawn {
        parent_session_id: SessionId,
        child_session_id: SessionId,
        agent_name: String,
        relationship: RelationshipRow,
    },

    ChildSessionCompleted {
        session_id: SessionId,
        parent_session_id: Option<SessionId>,
        duration_ms: Option<i64>,
    },

    SessionFailed {
        session_id: SessionId,
        parent_session_id: Option<SessionId>,
        error: Option<String>,
    },

    SessionTimeout {
        session_id: SessionId,
    },

    AgentStatusUpdate {
        session_id: SessionId,
        status: SessionStatus,
        agent_count: i64,
        total_tokens: i64,
    },

    HookStatusUpdate {
        session_id: SessionId,
        hook_event_type: HookEventType,
        timestamp: i64,
    },
}

impl Update {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::SessionSpawn { .. } => "session_spawn",
            Self::ChildSessionCompleted { .. } => "child_session_completed",
            Self::SessionFailed { .. } => "session_failed",
            Self::SessionTimeout { .. } => "session_timeout",
            Self::AgentStatusUpdate { .. } => "agent_status_update",
            Self::HookStatusUpdate { .. } => "hook_status_update",
        }
    }
}
