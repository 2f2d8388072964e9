use serde::{Deserialize, Serialize};

use argus_core::time::now_ms;
use argus_store::events::EventRow;
use argus_store::sessions::SessionRow;

/// Server→client messages that originate at the boundary rather than in
/// the engine. Engine updates (`argus_engine::Update`) already serialize
/// to the same `{type, data}` envelope and are forwarded as-is by the
/// bridge.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Initial { events: Vec<EventRow> },
    TerminalStatus(TerminalStatus),
    Pong { timestamp: i64 },
}

#[derive(Clone, Debug, Serialize)]
pub struct TerminalStatus {
    pub active_sessions: Vec<SessionRow>,
    pub timestamp: i64,
}

impl ServerMessage {
    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_ms(),
        }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Client→server messages on the stream socket.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    GetTerminalStatus,
}
