//! Low-level SQL helpers for the execution-log and async-task tables.
//!
//! Used from two places with different locking situations: the Raft apply
//! path already holds the connection (the `*_with` associated functions), and
//! node-local writers that need to take the lock themselves (the `&self`
//! methods). All inserts are `INSERT OR IGNORE` keyed on `unique_id` /
//! `(request_id, service)` so replays and duplicate fan-ins are no-ops.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use scheduler0_commons::models::{AsyncTask, AsyncTaskState, ExecutionState, JobExecutionLog};
use scheduler0_commons::constants::{
    ASYNC_TASKS_COMMITTED_TABLE, ASYNC_TASKS_UNCOMMITTED_TABLE, EXECUTIONS_COMMITTED_TABLE,
    EXECUTIONS_UNCOMMITTED_TABLE,
};

use crate::data_store::{SqliteStore, StoreError};

pub fn executions_table(committed: bool) -> &'static str {
    if committed {
        EXECUTIONS_COMMITTED_TABLE
    } else {
        EXECUTIONS_UNCOMMITTED_TABLE
    }
}

pub fn async_tasks_table(committed: bool) -> &'static str {
    if committed {
        ASYNC_TASKS_COMMITTED_TABLE
    } else {
        ASYNC_TASKS_UNCOMMITTED_TABLE
    }
}

/// Map a `SELECT *`-ordered row into a [`JobExecutionLog`].
pub fn execution_log_from_row(row: &Row<'_>) -> rusqlite::Result<JobExecutionLog> {
    Ok(JobExecutionLog {
        id: row.get(0)?,
        unique_id: row.get(1)?,
        state: parse_execution_state(&row.get::<_, String>(2)?)?,
        node_id: row.get(3)?,
        last_execution_datetime: parse_datetime(&row.get::<_, String>(4)?)?,
        next_execution_datetime: parse_datetime(&row.get::<_, String>(5)?)?,
        job_id: row.get(6)?,
        execution_version: row.get(7)?,
        job_queue_version: row.get(8)?,
        date_created: parse_datetime(&row.get::<_, String>(9)?)?,
    })
}

/// Map a `SELECT *`-ordered row into an [`AsyncTask`].
pub fn async_task_from_row(row: &Row<'_>) -> rusqlite::Result<AsyncTask> {
    Ok(AsyncTask {
        id: row.get(0)?,
        request_id: row.get(1)?,
        service: row.get(2)?,
        input: row.get(3)?,
        output: row.get(4)?,
        state: parse_async_task_state(&row.get::<_, String>(5)?)?,
        date_created: parse_datetime(&row.get::<_, String>(6)?)?,
    })
}

pub fn parse_datetime(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_execution_state(s: &str) -> rusqlite::Result<ExecutionState> {
    ExecutionState::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown execution state {s:?}").into(),
        )
    })
}

fn parse_async_task_state(s: &str) -> rusqlite::Result<AsyncTaskState> {
    AsyncTaskState::parse(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown async task state {s:?}").into(),
        )
    })
}

#[derive(Debug, Clone)]
pub struct SharedRepo {
    store: Arc<SqliteStore>,
}

impl SharedRepo {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }

    pub fn insert_execution_logs(
        &self,
        committed: bool,
        logs: &[JobExecutionLog],
    ) -> Result<u64, StoreError> {
        let conn = self.store.acquire();
        Self::insert_execution_logs_with(&conn, committed, logs)
    }

    /// Insert variant for callers that already hold the connection (the apply
    /// path). Returns the number of rows actually inserted.
    pub fn insert_execution_logs_with(
        conn: &Connection,
        committed: bool,
        logs: &[JobExecutionLog],
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} \
             (unique_id, state, node_id, last_execution_datetime, next_execution_datetime, \
              job_id, execution_version, job_queue_version, date_created) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            executions_table(committed)
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut inserted = 0u64;
        for log in logs {
            inserted += stmt.execute(params![
                log.unique_id,
                log.state.as_str(),
                log.node_id,
                log.last_execution_datetime.to_rfc3339(),
                log.next_execution_datetime.to_rfc3339(),
                log.job_id,
                log.execution_version,
                log.job_queue_version,
                log.date_created.to_rfc3339(),
            ])? as u64;
        }
        Ok(inserted)
    }

    /// Update a log row's terminal state by its deterministic id.
    pub fn update_execution_log_state(
        &self,
        committed: bool,
        unique_id: &str,
        state: ExecutionState,
        execution_version: u64,
    ) -> Result<u64, StoreError> {
        let conn = self.store.acquire();
        let sql = format!(
            "UPDATE {} SET state = ?1, execution_version = ?2 WHERE unique_id = ?3",
            executions_table(committed)
        );
        let affected = conn.execute(&sql, params![state.as_str(), execution_version, unique_id])?;
        Ok(affected as u64)
    }

    pub fn get_execution_logs(&self, committed: bool) -> Result<Vec<JobExecutionLog>, StoreError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT id, unique_id, state, node_id, last_execution_datetime, \
             next_execution_datetime, job_id, execution_version, job_queue_version, date_created \
             FROM {} ORDER BY id",
            executions_table(committed)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], execution_log_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count_execution_logs(&self, committed: bool) -> Result<u64, StoreError> {
        let conn = self.store.acquire();
        let sql = format!("SELECT count(*) FROM {}", executions_table(committed));
        let count: u64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn insert_async_tasks(
        &self,
        committed: bool,
        tasks: &[AsyncTask],
    ) -> Result<u64, StoreError> {
        let conn = self.store.acquire();
        Self::insert_async_tasks_with(&conn, committed, tasks)
    }

    pub fn insert_async_tasks_with(
        conn: &Connection,
        committed: bool,
        tasks: &[AsyncTask],
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} \
             (request_id, service, input, output, state, date_created) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            async_tasks_table(committed)
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut inserted = 0u64;
        for task in tasks {
            inserted += stmt.execute(params![
                task.request_id,
                task.service,
                task.input,
                task.output,
                task.state.as_str(),
                task.date_created.to_rfc3339(),
            ])? as u64;
        }
        Ok(inserted)
    }

    pub fn get_uncommitted_tasks(&self) -> Result<Vec<AsyncTask>, StoreError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT id, request_id, service, input, output, state, date_created \
             FROM {} ORDER BY id",
            async_tasks_table(false)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], async_task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_task_by_id(
        &self,
        committed: bool,
        id: u64,
    ) -> Result<Option<AsyncTask>, StoreError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT id, request_id, service, input, output, state, date_created \
             FROM {} WHERE id = ?1",
            async_tasks_table(committed)
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], async_task_from_row)?;
        match rows.next() {
            Some(task) => Ok(Some(task?)),
            None => Ok(None),
        }
    }

    /// Transition a node-local (uncommitted) task; used by the peer fan-in
    /// collector which never goes through the Raft log.
    pub fn update_uncommitted_task(
        &self,
        id: u64,
        state: AsyncTaskState,
        output: Option<&str>,
    ) -> Result<u64, StoreError> {
        let conn = self.store.acquire();
        let sql = format!(
            "UPDATE {} SET state = ?1, output = COALESCE(?2, output) WHERE id = ?3",
            async_tasks_table(false)
        );
        let affected = conn.execute(&sql, params![state.as_str(), output, id])?;
        Ok(affected as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::in_memory().unwrap())
    }

    fn sample_log(job_id: u64, execution_version: u64) -> JobExecutionLog {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        JobExecutionLog {
            id: 0,
            unique_id: JobExecutionLog::compute_unique_id(job_id, at, 1, execution_version),
            state: ExecutionState::Scheduled,
            node_id: 1,
            last_execution_datetime: at,
            next_execution_datetime: at,
            job_id,
            execution_version,
            job_queue_version: 1,
            date_created: at,
        }
    }

    #[test]
    fn execution_log_inserts_are_idempotent() {
        let repo = SharedRepo::new(store());
        let logs: Vec<_> = (1..=24).map(|job_id| sample_log(job_id, 1)).collect();

        assert_eq!(repo.insert_execution_logs(false, &logs).unwrap(), 24);
        assert_eq!(repo.insert_execution_logs(false, &logs).unwrap(), 0);
        assert_eq!(repo.count_execution_logs(false).unwrap(), 24);
        assert_eq!(repo.count_execution_logs(true).unwrap(), 0);
    }

    #[test]
    fn buckets_are_independent() {
        let repo = SharedRepo::new(store());
        let logs = vec![sample_log(1, 1)];

        repo.insert_execution_logs(false, &logs).unwrap();
        repo.insert_execution_logs(true, &logs).unwrap();

        assert_eq!(repo.count_execution_logs(false).unwrap(), 1);
        assert_eq!(repo.count_execution_logs(true).unwrap(), 1);
    }

    #[test]
    fn update_by_unique_id_sets_state_and_version() {
        let repo = SharedRepo::new(store());
        let log = sample_log(3, 1);
        repo.insert_execution_logs(false, &[log.clone()]).unwrap();

        let affected = repo
            .update_execution_log_state(false, &log.unique_id, ExecutionState::Success, 3)
            .unwrap();
        assert_eq!(affected, 1);

        let rows = repo.get_execution_logs(false).unwrap();
        assert_eq!(rows[0].state, ExecutionState::Success);
        assert_eq!(rows[0].execution_version, 3);
    }

    #[test]
    fn async_task_inserts_dedupe_on_request_id_and_service() {
        let repo = SharedRepo::new(store());
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let task = AsyncTask {
            id: 0,
            request_id: "r1".into(),
            service: "batch_insert_jobs".into(),
            input: "{}".into(),
            output: String::new(),
            state: AsyncTaskState::NotStarted,
            date_created: at,
        };

        assert_eq!(repo.insert_async_tasks(true, &[task.clone()]).unwrap(), 1);
        assert_eq!(repo.insert_async_tasks(true, &[task.clone()]).unwrap(), 0);

        // Same request id under a different service is a distinct task.
        let other = AsyncTask {
            service: "local_data".into(),
            ..task
        };
        assert_eq!(repo.insert_async_tasks(true, &[other]).unwrap(), 1);
    }

    #[test]
    fn uncommitted_task_lifecycle() {
        let repo = SharedRepo::new(store());
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let task = AsyncTask {
            id: 0,
            request_id: "peer-req".into(),
            service: "local_data".into(),
            input: String::new(),
            output: String::new(),
            state: AsyncTaskState::NotStarted,
            date_created: at,
        };
        repo.insert_async_tasks(false, &[task]).unwrap();

        let stored = &repo.get_uncommitted_tasks().unwrap()[0];
        repo.update_uncommitted_task(stored.id, AsyncTaskState::Success, Some("{\"x\":1}"))
            .unwrap();

        let reloaded = repo.get_task_by_id(false, stored.id).unwrap().unwrap();
        assert_eq!(reloaded.state, AsyncTaskState::Success);
        assert_eq!(reloaded.output, "{\"x\":1}");
    }
}
