use rusqlite::Connection;
use serde_json::json;
use tracing::warn;

use argus_core::events::HookEventType;
use argus_core::ids::SessionId;
use argus_core::session::{
    DelegationType, RelationshipType, SessionStatus, SessionType, SpawnReason,
};
use argus_store::error::StoreError;
use argus_store::events::EventRow;
use argus_store::relationships::{self, NewRelationship};
use argus_store::sessions::{self, SessionRow};

use crate::classify::classify;
use crate::updates::Update;

/// What one event did to session/relationship state. `touched` carries
/// the sessions whose aggregates changed, for cache mirroring.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub updates: Vec<Update>,
    pub touched: Vec<SessionRow>,
}

/// Maintains session rows and spawn edges from the flat event stream.
/// Runs inside the ingest transaction so relationship state is visible
/// before the event is broadcast.
///
/// Ambiguity policy: when a parent cannot be confidently resolved the
/// session stays unparented — a missing edge is recoverable, a wrong one
/// is not.
#[derive(Default)]
pub struct RelationshipEngine;

impl RelationshipEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn apply(&self, conn: &Connection, event: &EventRow) -> Result<ApplyOutcome, StoreError> {
        let mut updates = Vec::new();

        let session_type = if event.parent_session_id.is_some() {
            SessionType::Subagent
        } else if event.wave_id.is_some() {
            SessionType::Wave
        } else {
            SessionType::Main
        };

        // Lazy creation: both the session and any referenced parent get a
        // row on first sighting.
        if let Some(parent) = &event.parent_session_id {
            sessions::ensure_tx(conn, parent, &event.source_app, SessionType::Main, None, event.timestamp)?;
        }
        sessions::ensure_tx(
            conn,
            &event.session_id,
            &event.source_app,
            session_type,
            event.parent_session_id.as_ref(),
            event.timestamp,
        )?;

        match event.hook_event_type {
            HookEventType::SubagentStart => self.on_subagent_start(conn, event, &mut updates)?,
            HookEventType::SubagentStop => self.on_subagent_stop(conn, event, &mut updates)?,
            HookEventType::Stop => self.on_stop(conn, event, &mut updates)?,
            HookEventType::UserPromptSubmit => self.on_user_prompt(conn, event)?,
            _ => {}
        }

        updates.push(Update::HookStatusUpdate {
            session_id: event.session_id.clone(),
            hook_event_type: event.hook_event_type,
            timestamp: event.timestamp,
        });

        let mut touched = vec![sessions::get_tx(conn, &event.session_id)?];
        if let Some(parent) = &event.parent_session_id {
            if let Ok(row) = sessions::get_tx(conn, parent) {
                touched.push(row);
            }
        }

        Ok(ApplyOutcome { updates, touched })
    }

    fn on_subagent_start(
        &self,
        conn: &Connection,
        event: &EventRow,
        updates: &mut Vec<Update>,
    ) -> Result<(), StoreError> {
        let agent_name = extract_agent_name(&event.payload);
        let category = classify(&agent_name);
        sessions::merge_metadata_tx(conn, &event.session_id, "agent_name", json!(agent_name.clone()))?;
        sessions::merge_metadata_tx(conn, &event.session_id, "agent_category", json!(category.as_str()))?;

        let Some(parent) = &event.parent_session_id else {
            return Ok(());
        };

        let (relationship_type, spawn_reason) = spawn_classification(event);
        let delegation = extract_delegation_type(event);
        if spawn_reason == SpawnReason::Continuation {
            sessions::set_type_tx(conn, &event.session_id, SessionType::Continuation)?;
        } else if delegation == Some(DelegationType::Isolated) {
            sessions::set_type_tx(conn, &event.session_id, SessionType::Isolated)?;
        }

        let rel = NewRelationship {
            parent_session_id: parent,
            child_session_id: &event.session_id,
            relationship_type,
            spawn_reason,
            delegation_type: delegation,
            spawn_metadata: Some(json!({
                "agent_name": agent_name.clone(),
                "agent_category": category.as_str(),
            })),
            created_at: event.timestamp,
        };

        match relationships::create_tx(conn, &rel) {
            Ok(Some(relationship)) => {
                sessions::increment_agent_count_tx(conn, parent)?;
                updates.push(Update::SessionSpawn {
                    parent_session_id: parent.clone(),
                    child_session_id: event.session_id.clone(),
                    agent_name,
                    relationship,
                });
                push_status_update(conn, parent, updates)?;
            }
            Ok(None) => {
                // Duplicate spawn event for an existing edge.
            }
            Err(StoreError::Conflict(reason)) => {
                warn!(
                    parent = %parent,
                    child = %event.session_id,
                    reason = %reason,
                    "rejected spawn edge, leaving session unparented"
                );
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    fn on_subagent_stop(
        &self,
        conn: &Connection,
        event: &EventRow,
        updates: &mut Vec<Update>,
    ) -> Result<(), StoreError> {
        let failed = has_error_indicator(&event.payload);
        let status = if failed {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };

        // If no edge was recorded at spawn, recover one — from the
        // event's own parent field, or from the composite id convention
        // `{parent_uuid}_{sequence}_{timestamp}`. The composite parse only
        // counts when the prefix names a session we have already seen.
        let parent = match relationships::incoming_edge_tx(conn, &event.session_id)? {
            Some(edge) => Some(edge.parent_session_id),
            None => self.retroactive_parent(conn, event)?,
        };

        let changed = sessions::update_status_tx(conn, &event.session_id, status)?;
        sessions::set_end_tx(conn, &event.session_id, event.timestamp)?;
        sessions::add_tokens_tx(conn, &event.session_id, extract_tokens(&event.payload))?;
        relationships::complete_tx(conn, &event.session_id, event.timestamp)?;

        if changed {
            let session = sessions::get_tx(conn, &event.session_id)?;
            if failed {
                updates.push(Update::SessionFailed {
                    session_id: event.session_id.clone(),
                    parent_session_id: parent,
                    error: extract_error(&event.payload),
                });
            } else {
                updates.push(Update::ChildSessionCompleted {
                    session_id: event.session_id.clone(),
                    parent_session_id: parent,
                    duration_ms: session.duration_ms,
                });
            }
            push_status_update(conn, &event.session_id, updates)?;
        }

        Ok(())
    }

    /// Create the missing edge at stop time. Returns the parent when an
    /// edge was (or could have been) established.
    fn retroactive_parent(
        &self,
        conn: &Connection,
        event: &EventRow,
    ) -> Result<Option<SessionId>, StoreError> {
        let candidate = match &event.parent_session_id {
            Some(parent) => Some(parent.clone()),
            None => event
                .session_id
                .composite_parent()
                .filter(|parent| sessions::get_tx(conn, parent).is_ok()),
        };

        let Some(parent) = candidate else {
            return Ok(None);
        };
        if parent == event.session_id {
            return Ok(None);
        }

        let rel = NewRelationship {
            parent_session_id: &parent,
            child_session_id: &event.session_id,
            relationship_type: RelationshipType::ParentChild,
            spawn_reason: SpawnReason::SubagentDelegation,
            delegation_type: extract_delegation_type(event),
            spawn_metadata: Some(json!({"retroactive": true})),
            created_at: event.timestamp,
        };

        match relationships::create_tx(conn, &rel) {
            Ok(Some(_)) => {
                sessions::set_parent_tx(conn, &event.session_id, &parent)?;
                sessions::increment_agent_count_tx(conn, &parent)?;
                Ok(Some(parent))
            }
            Ok(None) => Ok(Some(parent)),
            Err(StoreError::Conflict(reason)) => {
                warn!(
                    parent = %parent,
                    child = %event.session_id,
                    reason = %reason,
                    "rejected retroactive edge, leaving session unparented"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn on_stop(
        &self,
        conn: &Connection,
        event: &EventRow,
        updates: &mut Vec<Update>,
    ) -> Result<(), StoreError> {
        let changed = sessions::update_status_tx(conn, &event.session_id, SessionStatus::Completed)?;
        sessions::set_end_tx(conn, &event.session_id, event.timestamp)?;
        sessions::add_tokens_tx(conn, &event.session_id, extract_tokens(&event.payload))?;
        relationships::complete_tx(conn, &event.session_id, event.timestamp)?;
        if changed {
            push_status_update(conn, &event.session_id, updates)?;
        }
        Ok(())
    }

    fn on_user_prompt(&self, conn: &Connection, event: &EventRow) -> Result<(), StoreError> {
        if let Some(prompt) = extract_prompt(&event.payload) {
            sessions::merge_metadata_tx(conn, &event.session_id, "last_prompt", json!(prompt))?;
        }
        Ok(())
    }
}

fn push_status_update(
    conn: &Connection,
    session_id: &SessionId,
    updates: &mut Vec<Update>,
) -> Result<(), StoreError> {
    let session = sessions::get_tx(conn, session_id)?;
    updates.push(Update::AgentStatusUpdate {
        session_id: session.session_id,
        status: session.status,
        agent_count: session.agent_count,
        total_tokens: session.total_tokens,
    });
    Ok(())
}

fn spawn_classification(event: &EventRow) -> (RelationshipType, SpawnReason) {
    if event.wave_id.is_some() {
        return (RelationshipType::WaveMember, SpawnReason::WaveOrchestration);
    }
    match event.payload.get("spawn_method").and_then(|v| v.as_str()) {
        Some("task_tool") => (RelationshipType::ParentChild, SpawnReason::TaskTool),
        Some("continuation") => (RelationshipType::Continuation, SpawnReason::Continuation),
        Some("manual") => (RelationshipType::ParentChild, SpawnReason::Manual),
        _ => (RelationshipType::ParentChild, SpawnReason::SubagentDelegation),
    }
}

/// Display name cascade used by the hook scripts.
fn extract_agent_name(payload: &serde_json::Value) -> String {
    for field in ["agent_name", "subagent_name", "agent", "name", "type"] {
        if let Some(name) = payload.get(field).and_then(|v| v.as_str()) {
            if !name.trim().is_empty() {
                return name.to_string();
            }
        }
    }
    "subagent".to_string()
}

fn extract_delegation_type(event: &EventRow) -> Option<DelegationType> {
    let from_context = event
        .delegation_context
        .as_ref()
        .and_then(|ctx| ctx.get("delegation_type"))
        .and_then(|v| v.as_str());
    let from_payload = event
        .payload
        .get("delegation_type")
        .and_then(|v| v.as_str());
    from_context.or(from_payload).and_then(|s| s.parse().ok())
}

const ERROR_MARKERS: &[&str] = &["error", "failed", "exception", "traceback"];
const RESULT_FIELDS: &[&str] = &["result", "output", "response", "stdout"];

fn has_error_indicator(payload: &serde_json::Value) -> bool {
    match payload.get("error") {
        Some(serde_json::Value::Null) | None => {}
        Some(serde_json::Value::Bool(b)) => return *b,
        Some(_) => return true,
    }
    if payload.get("status").and_then(|v| v.as_str()) == Some("failed") {
        return true;
    }
    for field in RESULT_FIELDS {
        if let Some(text) = payload.get(field).and_then(|v| v.as_str()) {
            let lower = text.to_lowercase();
            if ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
                return true;
            }
        }
    }
    false
}

fn extract_error(payload: &serde_json::Value) -> Option<String> {
    match payload.get("error") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Bool(true)) => Some("error reported".to_string()),
        _ => payload
            .get("result")
            .and_then(|v| v.as_str())
            .map(|s| s.chars().take(200).collect()),
    }
}

/// Token usage cascade: flat count, or a usage object.
fn extract_tokens(payload: &serde_json::Value) -> i64 {
    if let Some(tokens) = payload.get("tokens").and_then(|v| v.as_i64()) {
        return tokens;
    }
    if let Some(tokens) = payload.get("total_tokens").and_then(|v| v.as_i64()) {
        return tokens;
    }
    if let Some(usage) = payload.get("usage") {
        if let Some(total) = usage.get("total_tokens").and_then(|v| v.as_i64()) {
            return total;
        }
        let input = usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
        return input + output;
    }
    0
}

fn extract_prompt(payload: &serde_json::Value) -> Option<String> {
    for field in ["prompt", "prompt_text", "text", "message"] {
        if let Some(prompt) = payload.get(field).and_then(|v| v.as_str()) {
            if !prompt.trim().is_empty() {
                // Stored for display naming; cap the size.
                return Some(prompt.chars().take(500).collect());
            }
        }
    }
    None
}
