//! Single-connection SQLite store.
//!
//! Every read and write in the process goes through `acquire()`, which hands
//! out the one connection under a mutex. Holders must not await while holding
//! the guard.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use scheduler0_commons::SchedulerError;
use thiserror::Error;

use crate::migrations;
use crate::snapshot;

const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 64;
const BACKUP_PAUSE: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

/// The process-wide database handle.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    file_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    /// `":memory:"` opens an in-memory database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let (conn, file_path) = if path == ":memory:" {
            (Connection::open_in_memory()?, None)
        } else {
            (Connection::open(path)?, Some(PathBuf::from(path)))
        };
        let store = Self {
            conn: Mutex::new(conn),
            file_path,
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Take the connection lock. Dropping the guard releases it.
    pub fn acquire(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub fn file_path(&self) -> Option<&PathBuf> {
        self.file_path.as_ref()
    }

    /// Establish the schema. Idempotent.
    pub fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.acquire();
        migrations::migrate(&conn)?;
        Ok(())
    }

    /// Serialize the whole database into the framed snapshot format.
    ///
    /// Runs the SQLite backup API into a scratch file so the live connection
    /// (including in-memory databases) is captured consistently.
    pub fn serialize_snapshot(&self) -> Result<Vec<u8>, StoreError> {
        let conn = self.acquire();
        let scratch = tempfile::NamedTempFile::new()?;
        {
            let mut dst = Connection::open(scratch.path())?;
            let backup = Backup::new(&conn, &mut dst)?;
            backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)?;
        }
        let raw = std::fs::read(scratch.path())?;
        snapshot::encode(&raw).map_err(StoreError::Io)
    }

    /// Replace the database content with the snapshot `data`.
    pub fn restore_snapshot(&self, data: &[u8]) -> Result<(), StoreError> {
        let raw = snapshot::decode(data).map_err(StoreError::Io)?;
        let scratch = tempfile::NamedTempFile::new()?;
        std::fs::write(scratch.path(), &raw)?;

        let src = Connection::open(scratch.path())?;
        let mut conn = self.acquire();
        let backup = Backup::new(&src, &mut conn)?;
        backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("file_path", &self.file_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = store.acquire();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'projects'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        store.migrate().unwrap();
        store.migrate().unwrap();
    }

    #[test]
    fn snapshot_round_trip_preserves_rows() {
        let store = SqliteStore::in_memory().unwrap();
        {
            let conn = store.acquire();
            conn.execute(
                "INSERT INTO projects (name, description, date_created) VALUES (?1, ?2, ?3)",
                rusqlite::params!["p1", "a project", "2024-01-01T00:00:00+00:00"],
            )
            .unwrap();
        }

        let bytes = store.serialize_snapshot().unwrap();

        let other = SqliteStore::in_memory().unwrap();
        other.restore_snapshot(&bytes).unwrap();

        let conn = other.acquire();
        let name: String = conn
            .query_row("SELECT name FROM projects WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(name, "p1");
    }

    #[test]
    fn snapshot_of_restored_store_matches_original_content() {
        let store = SqliteStore::in_memory().unwrap();
        {
            let conn = store.acquire();
            conn.execute(
                "INSERT INTO projects (name, description, date_created) VALUES ('a', 'b', 'c')",
                [],
            )
            .unwrap();
        }
        let first = store.serialize_snapshot().unwrap();

        let restored = SqliteStore::in_memory().unwrap();
        restored.restore_snapshot(&first).unwrap();
        let second = restored.serialize_snapshot().unwrap();

        let other = SqliteStore::in_memory().unwrap();
        other.restore_snapshot(&second).unwrap();
        let conn = other.acquire();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM projects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
