use std::collections::HashMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use argus_core::ids::SessionId;
use argus_core::session::{DelegationType, RelationshipType, SpawnReason};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A directed parent→child edge in the spawn hierarchy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipRow {
    pub parent_session_id: SessionId,
    pub child_session_id: SessionId,
    pub relationship_type: RelationshipType,
    pub spawn_reason: SpawnReason,
    pub delegation_type: Option<DelegationType>,
    pub spawn_metadata: Option<serde_json::Value>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub depth_level: i64,
    pub session_path: String,
}

/// Insert parameters for a new edge; depth and path are derived from the
/// parent's existing edge inside `create_tx`.
pub struct NewRelationship<'a> {
    pub parent_session_id: &'a SessionId,
    pub child_session_id: &'a SessionId,
    pub relationship_type: RelationshipType,
    pub spawn_reason: SpawnReason,
    pub delegation_type: Option<DelegationType>,
    pub spawn_metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

pub struct RelationshipRepo {
    db: Database,
}

impl RelationshipRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, rel), fields(parent = %rel.parent_session_id, child = %rel.child_session_id))]
    pub fn create(&self, rel: &NewRelationship<'_>) -> Result<Option<RelationshipRow>, StoreError> {
        self.db.with_conn(|conn| create_tx(conn, rel))
    }

    #[instrument(skip(self))]
    pub fn get(
        &self,
        parent: &SessionId,
        child: &SessionId,
    ) -> Result<Option<RelationshipRow>, StoreError> {
        self.db.with_conn(|conn| get_tx(conn, parent, child))
    }

    /// Direct children of a session, oldest spawn first.
    #[instrument(skip(self), fields(parent = %parent))]
    pub fn children_of(&self, parent: &SessionId) -> Result<Vec<RelationshipRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_REL} WHERE parent_session_id = ?1 ORDER BY created_at ASC"
            ))?;
            let mut rows = stmt.query([parent.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_relationship(row)?);
            }
            Ok(results)
        })
    }

    /// All descendants of a session. Walks an in-memory parent→children
    /// index with an explicit stack instead of a recursive query.
    #[instrument(skip(self), fields(root = %root))]
    pub fn descendants_of(&self, root: &SessionId) -> Result<Vec<RelationshipRow>, StoreError> {
        let edges = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_REL} ORDER BY created_at ASC"))?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_relationship(row)?);
            }
            Ok(results)
        })?;

        let mut by_parent: HashMap<&str, Vec<&RelationshipRow>> = HashMap::new();
        for edge in &edges {
            by_parent
                .entry(edge.parent_session_id.as_str())
                .or_default()
                .push(edge);
        }

        let mut result = Vec::new();
        let mut stack = vec![root.as_str()];
        while let Some(current) = stack.pop() {
            if let Some(children) = by_parent.get(current) {
                for edge in children {
                    result.push((*edge).clone());
                    stack.push(edge.child_session_id.as_str());
                }
            }
        }
        Ok(result)
    }
}

const SELECT_REL: &str = "SELECT parent_session_id, child_session_id, relationship_type, \
     spawn_reason, delegation_type, spawn_metadata, created_at, completed_at, depth_level, \
     session_path FROM session_relationships";

/// Create an edge. Returns None when the (parent, child) pair already
/// exists. Rejects self-edges and edges that would close a cycle.
pub fn create_tx(
    conn: &Connection,
    rel: &NewRelationship<'_>,
) -> Result<Option<RelationshipRow>, StoreError> {
    if rel.parent_session_id == rel.child_session_id {
        return Err(StoreError::Conflict(format!(
            "self-relationship rejected for session {}",
            rel.parent_session_id
        )));
    }

    // Parent depth/path come from the parent's own incoming edge; a root
    // parent has depth 0 and a path of just its id.
    let parent_edge = incoming_edge_tx(conn, rel.parent_session_id)?;
    let (parent_depth, parent_path) = match &parent_edge {
        Some(edge) => (edge.depth_level, edge.session_path.clone()),
        None => (0, rel.parent_session_id.as_str().to_string()),
    };

    // Cycle guard: the child must not already be an ancestor of the parent.
    let ancestor_marker = format!("{}.", rel.child_session_id);
    if parent_path == rel.child_session_id.as_str()
        || parent_path.starts_with(&ancestor_marker)
        || parent_path.contains(&format!(".{}.", rel.child_session_id))
        || parent_path.ends_with(&format!(".{}", rel.child_session_id))
    {
        return Err(StoreError::Conflict(format!(
            "cycle rejected: {} is an ancestor of {}",
            rel.child_session_id, rel.parent_session_id
        )));
    }

    let depth_level = parent_depth + 1;
    let session_path = format!("{parent_path}.{}", rel.child_session_id);

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO session_relationships (parent_session_id, child_session_id, \
         relationship_type, spawn_reason, delegation_type, spawn_metadata, created_at, \
         depth_level, session_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            rel.parent_session_id.as_str(),
            rel.child_session_id.as_str(),
            rel.relationship_type.to_string(),
            rel.spawn_reason.to_string(),
            rel.delegation_type.map(|d| d.to_string()),
            rel.spawn_metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            rel.created_at,
            depth_level,
            session_path,
        ],
    )?;

    if inserted == 0 {
        return Ok(None);
    }

    Ok(Some(RelationshipRow {
        parent_session_id: rel.parent_session_id.clone(),
        child_session_id: rel.child_session_id.clone(),
        relationship_type: rel.relationship_type,
        spawn_reason: rel.spawn_reason,
        delegation_type: rel.delegation_type,
        spawn_metadata: rel.spawn_metadata.clone(),
        created_at: rel.created_at,
        completed_at: None,
        depth_level,
        session_path,
    }))
}

pub fn get_tx(
    conn: &Connection,
    parent: &SessionId,
    child: &SessionId,
) -> Result<Option<RelationshipRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_REL} WHERE parent_session_id = ?1 AND child_session_id = ?2"
    ))?;
    let mut rows = stmt.query([parent.as_str(), child.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_relationship(row)?)),
        None => Ok(None),
    }
}

/// The edge pointing at a session from its parent, if any.
pub fn incoming_edge_tx(
    conn: &Connection,
    child: &SessionId,
) -> Result<Option<RelationshipRow>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "{SELECT_REL} WHERE child_session_id = ?1 ORDER BY created_at ASC LIMIT 1"
    ))?;
    let mut rows = stmt.query([child.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_relationship(row)?)),
        None => Ok(None),
    }
}

/// Stamp completed_at on the child's incoming edges when the child
/// reaches a terminal state. Idempotent: already-stamped edges keep
/// their original timestamp.
pub fn complete_tx(
    conn: &Connection,
    child: &SessionId,
    completed_at: i64,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE session_relationships SET completed_at = ?1 \
         WHERE child_session_id = ?2 AND completed_at IS NULL",
        rusqlite::params![completed_at, child.as_str()],
    )?;
    Ok(())
}

fn row_to_relationship(row: &rusqlite::Row<'_>) -> Result<RelationshipRow, StoreError> {
    let type_str: String =
        row_helpers::get(row, 2, "session_relationships", "relationship_type")?;
    let reason_str: String = row_helpers::get(row, 3, "session_relationships", "spawn_reason")?;
    let delegation_str: Option<String> =
        row_helpers::get_opt(row, 4, "session_relationships", "delegation_type")?;
    let metadata = row_helpers::parse_json_opt(
        row_helpers::get_opt::<String>(row, 5, "session_relationships", "spawn_metadata")?,
        "session_relationships",
        "spawn_metadata",
    )?;

    Ok(RelationshipRow {
        parent_session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            0,
            "session_relationships",
            "parent_session_id",
        )?),
        child_session_id: SessionId::from_raw(row_helpers::get::<String>(
            row,
            1,
            "session_relationships",
            "child_session_id",
        )?),
        relationship_type: row_helpers::parse_enum(
            &type_str,
            "session_relationships",
            "relationship_type",
        )?,
        spawn_reason: row_helpers::parse_enum(&reason_str, "session_relationships", "spawn_reason")?,
        delegation_type: delegation_str
            .map(|s| row_helpers::parse_enum(&s, "session_relationships", "delegation_type"))
            .transpose()?,
        spawn_metadata: metadata,
        created_at: row_helpers::get(row, 6, "session_relationships", "created_at")?,
        completed_at: row_helpers::get_opt(row, 7, "session_relationships", "completed_at")?,
        depth_level: row_helpers::get(row, 8, "session_relationships", "depth_level")?,
        session_path: row_helpers::get(row, 9, "session_relationships", "session_path")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    fn new_rel<'a>(parent: &'a SessionId, child: &'a SessionId) -> NewRelationship<'a> {
        NewRelationship {
            parent_session_id: parent,
            child_session_id: child,
            relationship_type: RelationshipType::ParentChild,
            spawn_reason: SpawnReason::SubagentDelegation,
            delegation_type: None,
            spawn_metadata: None,
            created_at: 1000,
        }
    }

    #[test]
    fn create_root_child_edge() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db);
        let (a, b) = (sid("A"), sid("B"));

        let edge = repo.create(&new_rel(&a, &b)).unwrap().unwrap();
        assert_eq!(edge.depth_level, 1);
        assert_eq!(edge.session_path, "A.B");
        assert!(edge.completed_at.is_none());
    }

    #[test]
    fn depth_and_path_increase_along_chain() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db);
        let (a, b, c) = (sid("A"), sid("B"), sid("C"));

        let ab = repo.create(&new_rel(&a, &b)).unwrap().unwrap();
        let bc = repo.create(&new_rel(&b, &c)).unwrap().unwrap();

        assert_eq!(ab.depth_level, 1);
        assert_eq!(bc.depth_level, ab.depth_level + 1);
        assert_eq!(bc.session_path, "A.B.C");
    }

    #[test]
    fn self_relationship_rejected() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db);
        let a = sid("A");

        let result = repo.create(&new_rel(&a, &a));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn duplicate_edge_is_noop() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db);
        let (a, b) = (sid("A"), sid("B"));

        assert!(repo.create(&new_rel(&a, &b)).unwrap().is_some());
        assert!(repo.create(&new_rel(&a, &b)).unwrap().is_none());

        let children = repo.children_of(&a).unwrap();
        assert_eq!(children.len(), 1);
    }

    #[test]
    fn cycle_rejected() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db);
        let (a, b, c) = (sid("A"), sid("B"), sid("C"));

        repo.create(&new_rel(&a, &b)).unwrap();
        repo.create(&new_rel(&b, &c)).unwrap();

        // C → A would close the loop.
        let result = repo.create(&new_rel(&c, &a));
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // B → A likewise.
        let result = repo.create(&new_rel(&b, &a));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn complete_stamps_once() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db.clone());
        let (a, b) = (sid("A"), sid("B"));
        repo.create(&new_rel(&a, &b)).unwrap();

        db.with_conn(|conn| complete_tx(conn, &b, 5000)).unwrap();
        db.with_conn(|conn| complete_tx(conn, &b, 9999)).unwrap();

        let edge = repo.get(&a, &b).unwrap().unwrap();
        assert_eq!(edge.completed_at, Some(5000));
    }

    #[test]
    fn descendants_walk_covers_subtree() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db);
        let (a, b, c, d, x) = (sid("A"), sid("B"), sid("C"), sid("D"), sid("X"));

        repo.create(&new_rel(&a, &b)).unwrap();
        repo.create(&new_rel(&a, &c)).unwrap();
        repo.create(&new_rel(&b, &d)).unwrap();
        // Unrelated tree.
        repo.create(&new_rel(&x, &sid("Y"))).unwrap();

        let descendants = repo.descendants_of(&a).unwrap();
        let mut ids: Vec<&str> = descendants
            .iter()
            .map(|e| e.child_session_id.as_str())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["B", "C", "D"]);
    }

    #[test]
    fn metadata_round_trips() {
        let db = Database::in_memory().unwrap();
        let repo = RelationshipRepo::new(db);
        let (a, b) = (sid("A"), sid("B"));
        let mut rel = new_rel(&a, &b);
        rel.delegation_type = Some(DelegationType::Parallel);
        rel.spawn_metadata = Some(serde_json::json!({"agent_name": "reviewer"}));
        repo.create(&rel).unwrap();

        let edge = repo.get(&a, &b).unwrap().unwrap();
        assert_eq!(edge.delegation_type, Some(DelegationType::Parallel));
        assert_eq!(edge.spawn_metadata.unwrap()["agent_name"], "reviewer");
    }
}
