//! Snapshot repository: latest durable image of each agent, one row per
//! agent id, overwritten on change.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use forge_agent::types::{AgentLocation, AgentSnapshot, AgentStatus};

use crate::{Db, DbError};

const SELECT_COLS: &str = "agent_id, project, session_name, branch_name, status, task, profile, \
                           created_at, last_activity, last_response, last_user_message, \
                           sub_agent_count, location, parked";

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

fn scan_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("bad timestamp {raw:?}: {e}")))
}

fn scan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentSnapshot> {
    let status_raw: String = row.get(4)?;
    let status = AgentStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(4, format!("unknown status {status_raw:?}")))?;
    let location_raw: String = row.get(12)?;
    let location = AgentLocation::parse(&location_raw)
        .ok_or_else(|| conversion_err(12, format!("unknown location {location_raw:?}")))?;
    let sub_agent_count: i64 = row.get(11)?;

    Ok(AgentSnapshot {
        id: row.get(0)?,
        project: row.get(1)?,
        session_name: row.get(2)?,
        branch_name: row.get(3)?,
        status,
        // Not persisted; derived or refreshed by the manager on recovery.
        workspace_path: String::new(),
        created_at: scan_ts(row, 7)?,
        last_activity_at: scan_ts(row, 8)?,
        task: row.get(5)?,
        profile: row.get(6)?,
        sub_agent_count: u32::try_from(sub_agent_count.max(0)).unwrap_or(0),
        needs_attention: status.needs_attention(),
        parked: row.get::<_, i64>(13)? != 0,
        last_output: String::new(),
        last_response: row.get(9)?,
        last_user_message: row.get(10)?,
        location,
    })
}

pub struct SnapshotRepository<'a> {
    db: &'a Db,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Upserts the snapshot row for an agent. Saving identical state twice
    /// leaves the table unchanged.
    pub fn save(&self, agent: &AgentSnapshot) -> Result<(), DbError> {
        if agent.id.trim().is_empty() {
            return Err(DbError::Validation("agent id is required".into()));
        }
        self.db.conn().execute(
            "INSERT OR REPLACE INTO snapshots (
                agent_id, project, session_name, branch_name, status, task, profile,
                created_at, last_activity, last_response, last_user_message,
                sub_agent_count, location, parked
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                agent.id,
                agent.project,
                agent.session_name,
                agent.branch_name,
                agent.status.as_str(),
                agent.task,
                agent.profile,
                agent.created_at.to_rfc3339(),
                agent.last_activity_at.to_rfc3339(),
                agent.last_response,
                agent.last_user_message,
                i64::from(agent.sub_agent_count),
                agent.location.as_str(),
                i64::from(agent.parked),
            ],
        )?;
        Ok(())
    }

    /// Loads all snapshots whose status is not `stopped`: the recovery set.
    pub fn load_active(&self) -> Result<Vec<AgentSnapshot>, DbError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM snapshots WHERE status != 'stopped' ORDER BY agent_id"
        ))?;
        let rows = stmt.query_map([], scan_row)?;
        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row?);
        }
        Ok(snapshots)
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<AgentSnapshot>, DbError> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                &format!("SELECT {SELECT_COLS} FROM snapshots WHERE agent_id = ?1"),
                params![agent_id],
                scan_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Removes a snapshot row. Missing rows are fine.
    pub fn delete(&self, agent_id: &str) -> Result<(), DbError> {
        self.db
            .conn()
            .execute("DELETE FROM snapshots WHERE agent_id = ?1", params![agent_id])?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64, DbError> {
        Ok(self
            .db
            .conn()
            .query_row("SELECT count(*) FROM snapshots", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample(id: &str, status: AgentStatus) -> AgentSnapshot {
        let mut snapshot = AgentSnapshot::starting(
            id,
            "api",
            format!("forge__api__{id}"),
            format!("/tmp/api/.worktrees/{id}"),
            format!("agent/{id}/task"),
        );
        snapshot.status = status;
        snapshot.task = "fix bug".to_string();
        snapshot.last_user_message = "status?".to_string();
        snapshot
    }

    #[test]
    fn save_then_get_round_trips_fields() {
        let db = Db::open_in_memory().unwrap();
        let repo = SnapshotRepository::new(&db);
        let agent = sample("a1b2c3", AgentStatus::Working);
        repo.save(&agent).unwrap();

        let loaded = repo.get("a1b2c3").unwrap().unwrap();
        assert_eq!(loaded.id, agent.id);
        assert_eq!(loaded.project, "api");
        assert_eq!(loaded.session_name, agent.session_name);
        assert_eq!(loaded.status, AgentStatus::Working);
        assert_eq!(loaded.task, "fix bug");
        assert_eq!(loaded.last_user_message, "status?");
        assert_eq!(loaded.location, AgentLocation::Local);
    }

    #[test]
    fn save_is_idempotent_single_row() {
        let db = Db::open_in_memory().unwrap();
        let repo = SnapshotRepository::new(&db);
        let agent = sample("a1b2c3", AgentStatus::Idle);
        repo.save(&agent).unwrap();
        repo.save(&agent).unwrap();
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn upsert_overwrites_on_change() {
        let db = Db::open_in_memory().unwrap();
        let repo = SnapshotRepository::new(&db);
        let mut agent = sample("a1b2c3", AgentStatus::Working);
        repo.save(&agent).unwrap();

        agent.status = AgentStatus::Stopped;
        agent.sub_agent_count = 2;
        repo.save(&agent).unwrap();

        assert_eq!(repo.count().unwrap(), 1);
        let loaded = repo.get("a1b2c3").unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Stopped);
        assert_eq!(loaded.sub_agent_count, 2);
    }

    #[test]
    fn load_active_excludes_stopped() {
        let db = Db::open_in_memory().unwrap();
        let repo = SnapshotRepository::new(&db);
        repo.save(&sample("aaaaaa", AgentStatus::Working)).unwrap();
        repo.save(&sample("bbbbbb", AgentStatus::Stopped)).unwrap();
        repo.save(&sample("cccccc", AgentStatus::WaitingInput)).unwrap();

        let active = repo.load_active().unwrap();
        let ids: Vec<&str> = active.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["aaaaaa", "cccccc"]);
    }

    #[test]
    fn delete_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let repo = SnapshotRepository::new(&db);
        repo.save(&sample("a1b2c3", AgentStatus::Idle)).unwrap();
        repo.delete("a1b2c3").unwrap();
        repo.delete("a1b2c3").unwrap();
        assert!(repo.get("a1b2c3").unwrap().is_none());
    }
}
