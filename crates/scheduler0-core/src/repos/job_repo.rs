//! Job repository.
//!
//! `spec`, `timezone`, and `project_id` are frozen at creation; updates that
//! touch them are rejected before anything reaches the log.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use scheduler0_commons::constants::JOBS_TABLE;
use scheduler0_commons::models::Job;
use scheduler0_commons::{Clock, SchedulerError};
use scheduler0_raft::{RaftActions, SqlValue};
use scheduler0_store::SqliteStore;

use super::{job_columns, job_from_row, placeholders};
use crate::schedule;

const ORDER_BY_WHITELIST: &[&str] = &["id", "date_created"];

/// Fields accepted at creation.
#[derive(Debug, Clone, Default)]
pub struct JobDraft {
    pub project_id: u64,
    pub spec: String,
    pub timezone: String,
    pub callback_url: String,
    pub data: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Fields a PUT may carry. Immutable fields present here are checked against
/// the stored row and rejected when they differ.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub spec: Option<String>,
    pub timezone: Option<String>,
    pub project_id: Option<u64>,
    pub callback_url: Option<String>,
    pub data: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct JobRepo {
    store: Arc<SqliteStore>,
    actions: Arc<RaftActions>,
    clock: Arc<dyn Clock>,
}

impl JobRepo {
    pub fn new(store: Arc<SqliteStore>, actions: Arc<RaftActions>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            actions,
            clock,
        }
    }

    fn validate_draft(&self, draft: &JobDraft) -> Result<(), SchedulerError> {
        if draft.project_id == 0 {
            return Err(SchedulerError::validation("projectId field is required"));
        }
        if draft.callback_url.is_empty() {
            return Err(SchedulerError::validation("callbackUrl field is required"));
        }
        schedule::validate(&draft.spec, &draft.timezone)?;

        let project_exists: bool = {
            let conn = self.store.acquire();
            conn.query_row(
                "SELECT count(*) FROM projects WHERE id = ?1",
                params![draft.project_id],
                |r| r.get::<_, i64>(0),
            )
            .map(|count| count > 0)
            .map_err(|e| SchedulerError::internal(e.to_string()))?
        };
        if !project_exists {
            return Err(SchedulerError::validation(format!(
                "project with id {} does not exist",
                draft.project_id
            )));
        }
        Ok(())
    }

    pub async fn create_one(&self, draft: JobDraft) -> Result<Job, SchedulerError> {
        let ids = self.batch_insert(vec![draft]).await?;
        self.get_one_by_id(ids[0])?
            .ok_or_else(|| SchedulerError::internal("created job not found"))
    }

    /// Insert many jobs in one command. Returns the new ids in input order.
    pub async fn batch_insert(&self, drafts: Vec<JobDraft>) -> Result<Vec<u64>, SchedulerError> {
        if drafts.is_empty() {
            return Err(SchedulerError::validation("no jobs to insert"));
        }
        for draft in &drafts {
            self.validate_draft(draft)?;
        }

        let now = self.clock.now();
        let mut values = Vec::with_capacity(drafts.len());
        let mut sql_params: Vec<SqlValue> = Vec::with_capacity(drafts.len() * 8);
        for (i, draft) in drafts.iter().enumerate() {
            let base = i * 8;
            values.push(format!(
                "(?{}, ?{}, ?{}, ?{}, ?{}, ?{}, ?{}, ?{})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7,
                base + 8,
            ));
            sql_params.push(SqlValue::from(draft.project_id));
            sql_params.push(SqlValue::from(draft.spec.clone()));
            sql_params.push(SqlValue::from(draft.timezone.clone()));
            sql_params.push(SqlValue::from(draft.callback_url.clone()));
            sql_params.push(SqlValue::from(draft.data.clone()));
            sql_params.push(SqlValue::from(draft.start_date));
            sql_params.push(SqlValue::from(draft.end_date));
            sql_params.push(SqlValue::from(now));
        }

        let sql = format!(
            "INSERT INTO {JOBS_TABLE} \
             (project_id, spec, timezone, callback_url, data, start_date, end_date, date_created) \
             VALUES {}",
            values.join(", ")
        );
        let response = self.actions.write_db_command(sql, sql_params).await?;

        let last = response.last_inserted_id;
        let first = last + 1 - response.rows_affected;
        Ok((first..=last).collect())
    }

    pub fn get_one_by_id(&self, id: u64) -> Result<Option<Job>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!("SELECT {} FROM {JOBS_TABLE} WHERE id = ?1", job_columns());
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![id], job_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(job) => Ok(Some(job.map_err(|e| SchedulerError::internal(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// Paged listing for one project. `order_by` is whitelisted.
    pub fn get_all_by_project_id(
        &self,
        project_id: u64,
        offset: u64,
        limit: u64,
        order_by: &str,
    ) -> Result<Vec<Job>, SchedulerError> {
        if !ORDER_BY_WHITELIST.contains(&order_by) {
            return Err(SchedulerError::validation(format!(
                "cannot order by {order_by:?}"
            )));
        }
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {JOBS_TABLE} WHERE project_id = ?1 \
             ORDER BY {order_by} LIMIT ?2 OFFSET ?3",
            job_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![project_id, limit, offset], job_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    pub fn count_by_project_id(&self, project_id: u64) -> Result<u64, SchedulerError> {
        let conn = self.store.acquire();
        conn.query_row(
            &format!("SELECT count(*) FROM {JOBS_TABLE} WHERE project_id = ?1"),
            params![project_id],
            |r| r.get(0),
        )
        .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Apply a PUT. Changes to `spec`, `timezone`, or `project_id` are
    /// rejected; the remaining fields are overwritten when present.
    pub async fn update_one_by_id(
        &self,
        id: u64,
        update: JobUpdate,
    ) -> Result<Job, SchedulerError> {
        let existing = self
            .get_one_by_id(id)?
            .ok_or_else(|| SchedulerError::not_found(format!("job with id {id} does not exist")))?;

        if let Some(spec) = &update.spec {
            if *spec != existing.spec {
                return Err(SchedulerError::validation("job spec cannot be updated"));
            }
        }
        if let Some(timezone) = &update.timezone {
            if *timezone != existing.timezone {
                return Err(SchedulerError::validation("job timezone cannot be updated"));
            }
        }
        if let Some(project_id) = update.project_id {
            if project_id != existing.project_id {
                return Err(SchedulerError::validation(
                    "job projectId cannot be updated",
                ));
            }
        }

        let callback_url = update.callback_url.unwrap_or(existing.callback_url);
        if callback_url.is_empty() {
            return Err(SchedulerError::validation("callbackUrl field is required"));
        }
        let data = update.data.unwrap_or(existing.data);
        let start_date = update.start_date.or(existing.start_date);
        let end_date = update.end_date.or(existing.end_date);

        self.actions
            .write_db_command(
                format!(
                    "UPDATE {JOBS_TABLE} \
                     SET callback_url = ?1, data = ?2, start_date = ?3, end_date = ?4 \
                     WHERE id = ?5"
                ),
                vec![
                    SqlValue::from(callback_url),
                    SqlValue::from(data),
                    SqlValue::from(start_date),
                    SqlValue::from(end_date),
                    SqlValue::from(id),
                ],
            )
            .await?;

        self.get_one_by_id(id)?
            .ok_or_else(|| SchedulerError::internal("updated job not found"))
    }

    pub async fn delete_one_by_id(&self, id: u64) -> Result<u64, SchedulerError> {
        if self.get_one_by_id(id)?.is_none() {
            return Err(SchedulerError::not_found(format!(
                "job with id {id} does not exist"
            )));
        }
        let response = self
            .actions
            .write_db_command(
                format!("DELETE FROM {JOBS_TABLE} WHERE id = ?1"),
                vec![SqlValue::from(id)],
            )
            .await?;
        Ok(response.rows_affected)
    }

    pub fn batch_get_by_ids(&self, job_ids: &[u64]) -> Result<Vec<Job>, SchedulerError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let unique: BTreeSet<u64> = job_ids.iter().copied().collect();
        let ids: Vec<u64> = unique.into_iter().collect();

        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {JOBS_TABLE} WHERE id IN ({})",
            job_columns(),
            placeholders(1, ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(ids.iter().map(|id| *id as i64)),
                job_from_row,
            )
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Jobs whose id falls in the node's assigned `[lower, upper]` range.
    pub fn get_jobs_in_range(&self, lower: u64, upper: u64) -> Result<Vec<Job>, SchedulerError> {
        if lower == 0 && upper == 0 {
            return Ok(Vec::new());
        }
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {} FROM {JOBS_TABLE} WHERE id >= ?1 AND id <= ?2 ORDER BY id",
            job_columns()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![lower, upper], job_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Highest job id, or 0 when no jobs exist.
    pub fn get_max_id(&self) -> Result<u64, SchedulerError> {
        let conn = self.store.acquire();
        conn.query_row(
            &format!("SELECT COALESCE(MAX(id), 0) FROM {JOBS_TABLE}"),
            [],
            |r| r.get(0),
        )
        .map_err(|e| SchedulerError::internal(e.to_string()))
    }
}
