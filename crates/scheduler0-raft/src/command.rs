//! Replicated command log entries and their wire codec.
//!
//! Every write in the system is one of these variants, bincode-serialized
//! into the Raft log. Apply is deterministic: commands carry their own
//! timestamps and parameters, computed by the submitting leader.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value};
use rusqlite::ToSql;
use scheduler0_commons::models::{AsyncTask, AsyncTaskState, JobExecutionLog, LocalData, NodeRange};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::RaftError;

/// A SQL parameter that can cross the Raft log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Owned(Value::Text(v.clone())),
            SqlValue::Blob(v) => ToSqlOutput::Owned(Value::Blob(v.clone())),
        })
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Text(v.to_rfc3339())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

/// Async-task transitions that go through the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AsyncTaskCommand {
    /// Insert tasks (idempotent on `(request_id, service)`).
    Create { tasks: Vec<AsyncTask> },
    /// Transition tasks, optionally compare-and-set from `expected_state`.
    /// Only the submitter whose expectation matches wins the claim.
    UpdateState {
        task_ids: Vec<u64>,
        state: AsyncTaskState,
        output: Option<String>,
        expected_state: Option<AsyncTaskState>,
    },
}

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Arbitrary parameterized mutation, validated before submission.
    DbExecute { sql: String, params: Vec<SqlValue> },

    /// Publish a job-queue allocation: bump the version and record one range
    /// row per node, atomically.
    JobQueue {
        number_of_active_nodes: u64,
        ranges: Vec<NodeRange>,
        date_created: DateTime<Utc>,
    },

    AsyncTask(AsyncTaskCommand),

    /// Batch-commit execution logs collected during fan-in.
    ExecutionLogs { logs: Vec<JobExecutionLog> },

    /// Compound payload shipped by a peer during leader recovery.
    LocalData { data: LocalData },
}

/// Result of applying a command, returned to the submitting caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CommandResponse {
    pub last_inserted_id: u64,
    pub rows_affected: u64,
    /// Resolved async-task ids for `AsyncTaskCommand::Create`.
    pub task_ids: Vec<u64>,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RaftError> {
    Ok(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RaftError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn command_codec_round_trips() {
        let cmd = Command::DbExecute {
            sql: "INSERT INTO projects (name) VALUES (?1)".into(),
            params: vec![SqlValue::Text("p".into()), SqlValue::Integer(3)],
        };
        let bytes = encode(&cmd).unwrap();
        let back: Command = decode(&bytes).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn job_queue_command_round_trips() {
        let cmd = Command::JobQueue {
            number_of_active_nodes: 2,
            ranges: vec![
                NodeRange {
                    node_id: 1,
                    lower_bound_job_id: 1,
                    upper_bound_job_id: 5,
                },
                NodeRange {
                    node_id: 2,
                    lower_bound_job_id: 6,
                    upper_bound_job_id: 10,
                },
            ],
            date_created: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let back: Command = decode(&encode(&cmd).unwrap()).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn sql_values_bind() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER, b TEXT, c REAL, d BLOB, e INTEGER)")
            .unwrap();
        let params = vec![
            SqlValue::Integer(7),
            SqlValue::Text("x".into()),
            SqlValue::Real(1.5),
            SqlValue::Blob(vec![1, 2]),
            SqlValue::Null,
        ];
        conn.execute(
            "INSERT INTO t VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params_from_iter(params.iter()),
        )
        .unwrap();
        let (a, b): (i64, String) = conn
            .query_row("SELECT a, b FROM t", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!((a, b.as_str()), (7, "x"));
    }
}
