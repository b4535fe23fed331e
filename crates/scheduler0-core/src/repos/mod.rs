//! Domain repositories.
//!
//! Thin contracts over the store and the Raft log: every write is submitted
//! through [`scheduler0_raft::RaftActions`] and every read goes straight to
//! the SQLite connection under its lock. Validation happens here, before a
//! command can reach the log.

mod async_task_repo;
mod credential_repo;
mod execution_repo;
mod job_queue_repo;
mod job_repo;
mod project_repo;

pub use async_task_repo::AsyncTaskRepo;
pub use credential_repo::CredentialRepo;
pub use execution_repo::{ExecutionEntry, ExecutionsRepo};
pub use job_queue_repo::JobQueueRepo;
pub use job_repo::{JobDraft, JobRepo, JobUpdate};
pub use project_repo::ProjectRepo;

use chrono::{DateTime, Utc};
use rusqlite::Row;
use scheduler0_commons::models::{Credential, Job, JobQueueLog, Project};
use scheduler0_store::shared_repo::parse_datetime;

pub(crate) fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        date_created: parse_datetime(&row.get::<_, String>(3)?)?,
    })
}

pub(crate) fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        project_id: row.get(1)?,
        spec: row.get(2)?,
        timezone: row.get(3)?,
        callback_url: row.get(4)?,
        data: row.get(5)?,
        start_date: parse_optional_datetime(row.get::<_, Option<String>>(6)?)?,
        end_date: parse_optional_datetime(row.get::<_, Option<String>>(7)?)?,
        date_created: parse_datetime(&row.get::<_, String>(8)?)?,
    })
}

pub(crate) fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    Ok(Credential {
        id: row.get(0)?,
        api_key: row.get(1)?,
        api_secret: row.get(2)?,
        archived: row.get::<_, i64>(3)? != 0,
        date_created: parse_datetime(&row.get::<_, String>(4)?)?,
    })
}

pub(crate) fn job_queue_log_from_row(row: &Row<'_>) -> rusqlite::Result<JobQueueLog> {
    Ok(JobQueueLog {
        id: row.get(0)?,
        node_id: row.get(1)?,
        lower_bound_job_id: row.get(2)?,
        upper_bound_job_id: row.get(3)?,
        version: row.get(4)?,
        date_created: parse_datetime(&row.get::<_, String>(5)?)?,
    })
}

fn parse_optional_datetime(value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match value {
        Some(s) => Ok(Some(parse_datetime(&s)?)),
        None => Ok(None),
    }
}

const JOB_COLUMNS: &str =
    "id, project_id, spec, timezone, callback_url, data, start_date, end_date, date_created";
const PROJECT_COLUMNS: &str = "id, name, description, date_created";
const CREDENTIAL_COLUMNS: &str = "id, api_key, api_secret, archived, date_created";

pub(crate) fn job_columns() -> &'static str {
    JOB_COLUMNS
}

pub(crate) fn project_columns() -> &'static str {
    PROJECT_COLUMNS
}

pub(crate) fn credential_columns() -> &'static str {
    CREDENTIAL_COLUMNS
}

/// Build `?N,?N+1,...` placeholder lists for `IN` clauses.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (0..count)
        .map(|i| format!("?{}", start + i))
        .collect::<Vec<_>>()
        .join(",")
}
