//! Event repository: persistence for the append-only `events` log.
//!
//! Rows are never mutated after insert. A failed write is the caller's
//! cue to log and drop, never to crash.

use rusqlite::{params, params_from_iter, types::Value};

use crate::{now_rfc3339, Db, DbError};

// Event kinds written by the kernel. The column is free-form text so
// embedders can add their own kinds without a migration.
pub const KIND_SPAWNED: &str = "spawned";
pub const KIND_KILLED: &str = "killed";
pub const KIND_RESTARTED: &str = "restarted";
pub const KIND_STATUS_CHANGE: &str = "status_change";
pub const KIND_USER_MESSAGE: &str = "user_message";
pub const KIND_AGENT_RESPONSE: &str = "agent_response";
pub const KIND_WAITING_INPUT: &str = "waiting_input";
pub const KIND_SUB_AGENT_START: &str = "sub_agent_start";
pub const KIND_SUB_AGENT_STOP: &str = "sub_agent_stop";
pub const KIND_ERROR: &str = "error";
pub const KIND_CRASHED: &str = "crashed";

/// One row of the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub agent_id: String,
    pub project: String,
    pub kind: String,
    pub payload: Option<serde_json::Value>,
    pub ts: String,
}

/// Filter for tail queries. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub agent_id: Option<String>,
    pub project: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 100;

fn scan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let payload_json: Option<String> = row.get(4)?;
    let payload = payload_json
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok());
    Ok(Event {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        project: row.get(2)?,
        kind: row.get(3)?,
        payload,
        ts: row.get(5)?,
    })
}

pub struct EventRepository<'a> {
    db: &'a Db,
}

impl<'a> EventRepository<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Appends an event, returning its row id.
    pub fn log(
        &self,
        agent_id: &str,
        project: &str,
        kind: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<i64, DbError> {
        if kind.trim().is_empty() {
            return Err(DbError::Validation("event kind is required".into()));
        }
        let payload_json = match payload {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| DbError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO events (agent_id, project, kind, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![agent_id, project, kind, payload_json, now_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Chronological tail query, newest first.
    pub fn recent(&self, filter: &EventFilter) -> Result<Vec<Event>, DbError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(ref agent_id) = filter.agent_id {
            clauses.push("agent_id = ?");
            values.push(Value::Text(agent_id.clone()));
        }
        if let Some(ref project) = filter.project {
            clauses.push("project = ?");
            values.push(Value::Text(project.clone()));
        }
        if let Some(ref kind) = filter.kind {
            clauses.push("kind = ?");
            values.push(Value::Text(kind.clone()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).max(0);
        values.push(Value::Integer(limit));

        let sql = format!(
            "SELECT id, agent_id, project, kind, payload, ts FROM events{where_sql} \
             ORDER BY id DESC LIMIT ?"
        );

        let conn = self.db.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), scan_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}
