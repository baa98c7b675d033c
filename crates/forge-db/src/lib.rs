//! SQLite persistence: the append-only event log and the one-row-per-agent
//! snapshot table.
//!
//! A single mutex-guarded connection serializes writes; reads go through
//! the same handle, which is cheap at this workload. Repositories borrow
//! the [`Db`] and never outlive it.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

pub mod event_repository;
pub mod snapshot_repository;

pub use event_repository::{Event, EventFilter, EventRepository};
pub use snapshot_repository::SnapshotRepository;

/// Bump when the embedded schema changes shape.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    project TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT,
    ts TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id);
CREATE INDEX IF NOT EXISTS idx_events_project ON events(project);
CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);

CREATE TABLE IF NOT EXISTS snapshots (
    agent_id TEXT PRIMARY KEY,
    project TEXT NOT NULL,
    session_name TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    status TEXT NOT NULL,
    task TEXT NOT NULL DEFAULT '',
    profile TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    last_response TEXT NOT NULL DEFAULT '',
    last_user_message TEXT NOT NULL DEFAULT '',
    sub_agent_count INTEGER NOT NULL DEFAULT 0,
    location TEXT NOT NULL DEFAULT 'local',
    parked INTEGER NOT NULL DEFAULT 0
);
";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Shared database handle.
#[derive(Debug)]
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Serialized access to the underlying connection.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn schema_version(&self) -> Result<i64, DbError> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), DbError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(DbError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < SCHEMA_VERSION {
            let conn = self.conn();
            conn.execute_batch(SCHEMA)?;
            conn.execute(&format!("PRAGMA user_version = {SCHEMA_VERSION}"), [])?;
        }
        Ok(())
    }
}

/// Timestamp format used everywhere in the store. RFC 3339 with fixed
/// precision so lexical order equals chronological order.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_applies_schema() {
        let db = Db::open_in_memory().expect("open");
        assert_eq!(db.schema_version().expect("version"), SCHEMA_VERSION);

        let count: i64 = db
            .conn()
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN ('events', 'snapshots')",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(count, 2);
    }

    #[test]
    fn future_schema_version_is_rejected() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute("PRAGMA user_version = 99", []).expect("pragma");
        let err = Db::from_connection(conn).expect_err("should reject");
        assert!(matches!(
            err,
            DbError::UnsupportedSchemaVersion { found: 99, .. }
        ));
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = now_rfc3339();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_rfc3339();
        assert!(a < b);
    }
}
