use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Lifecycle hook events reported by agent runtimes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HookEventType {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    SubagentStart,
    SubagentStop,
    Notification,
    Stop,
    PreCompact,
}

impl HookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::UserPromptSubmit => "UserPromptSubmit",
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::SubagentStart => "SubagentStart",
            Self::SubagentStop => "SubagentStop",
            Self::Notification => "Notification",
            Self::Stop => "Stop",
            Self::PreCompact => "PreCompact",
        }
    }
}

impl std::fmt::Display for HookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HookEventType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SessionStart" => Ok(Self::SessionStart),
            "UserPromptSubmit" => Ok(Self::UserPromptSubmit),
            "PreToolUse" => Ok(Self::PreToolUse),
            "PostToolUse" => Ok(Self::PostToolUse),
            "SubagentStart" => Ok(Self::SubagentStart),
            "SubagentStop" => Ok(Self::SubagentStop),
            "Notification" => Ok(Self::Notification),
            "Stop" => Ok(Self::Stop),
            "PreCompact" => Ok(Self::PreCompact),
            other => Err(format!("unknown hook event type: {other}")),
        }
    }
}

/// An inbound hook event as posted by a runtime hook script.
/// `id` and `timestamp` are assigned by the store when absent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookEvent {
    pub source_app: String,
    pub session_id: SessionId,
    pub hook_event_type: HookEventType,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub chat: Option<serde_json::Value>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub parent_session_id: Option<SessionId>,
    #[serde(default)]
    pub session_depth: Option<i64>,
    #[serde(default)]
    pub wave_id: Option<String>,
    #[serde(default)]
    pub delegation_context: Option<serde_json::Value>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl HookEvent {
    pub fn new(
        source_app: impl Into<String>,
        session_id: SessionId,
        hook_event_type: HookEventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source_app: source_app.into(),
            session_id,
            hook_event_type,
            payload,
            chat: None,
            summary: None,
            timestamp: None,
            parent_session_id: None,
            session_depth: None,
            wave_id: None,
            delegation_context: None,
            correlation_id: None,
        }
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_app.trim().is_empty() {
            return Err(ValidationError::MissingField("source_app"));
        }
        if self.session_id.is_empty() {
            return Err(ValidationError::MissingField("session_id"));
        }
        if let Some(ts) = self.timestamp {
            if ts < 0 {
                return Err(ValidationError::InvalidField("timestamp"));
            }
        }
        if let Some(depth) = self.session_depth {
            if depth < 0 {
                return Err(ValidationError::InvalidField("session_depth"));
            }
        }
        if let Some(parent) = &self.parent_session_id {
            if parent == &self.session_id {
                return Err(ValidationError::SelfParent);
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for field: {0}")]
    InvalidField(&'static str),

    #[error("parent_session_id equals session_id")]
    SelfParent,
}

fn default_payload() -> serde_json::Value {
    serde_json::json!({})
}
