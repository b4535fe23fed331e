//! Execution-log repository.
//!
//! Queries span both buckets: the committed table is replicated truth, the
//! uncommitted table holds fires this node has produced but not yet fanned in.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use scheduler0_commons::models::{ExecutionState, JobExecutionLog};
use scheduler0_commons::{Clock, NodeId, SchedulerError};
use scheduler0_store::shared_repo::{self, execution_log_from_row};
use scheduler0_store::{SharedRepo, SqliteStore};

use super::placeholders;

const EXECUTION_COLUMNS: &str = "id, unique_id, state, node_id, last_execution_datetime, \
     next_execution_datetime, job_id, execution_version, job_queue_version, date_created";

/// One fire to record: everything but the state and the derived unique id.
#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    pub job_id: u64,
    pub last_execution_datetime: DateTime<Utc>,
    pub next_execution_datetime: DateTime<Utc>,
    pub execution_version: u64,
    pub job_queue_version: u64,
}

#[derive(Clone)]
pub struct ExecutionsRepo {
    store: Arc<SqliteStore>,
    shared: SharedRepo,
    clock: Arc<dyn Clock>,
    node_id: NodeId,
}

impl ExecutionsRepo {
    pub fn new(
        store: Arc<SqliteStore>,
        shared: SharedRepo,
        clock: Arc<dyn Clock>,
        node_id: NodeId,
    ) -> Self {
        Self {
            store,
            shared,
            clock,
            node_id,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Record a batch of fires in one state. Returns the constructed rows
    /// (with their deterministic unique ids).
    pub fn batch_insert(
        &self,
        entries: &[ExecutionEntry],
        state: ExecutionState,
        committed: bool,
    ) -> Result<Vec<JobExecutionLog>, SchedulerError> {
        let now = self.clock.now();
        let logs: Vec<JobExecutionLog> = entries
            .iter()
            .map(|entry| JobExecutionLog {
                id: 0,
                unique_id: JobExecutionLog::compute_unique_id(
                    entry.job_id,
                    entry.next_execution_datetime,
                    self.node_id,
                    entry.execution_version,
                ),
                state,
                node_id: self.node_id,
                last_execution_datetime: entry.last_execution_datetime,
                next_execution_datetime: entry.next_execution_datetime,
                job_id: entry.job_id,
                execution_version: entry.execution_version,
                job_queue_version: entry.job_queue_version,
                date_created: now,
            })
            .collect();
        self.shared
            .insert_execution_logs(committed, &logs)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        Ok(logs)
    }

    pub fn count_execution_logs(&self, committed: bool) -> Result<u64, SchedulerError> {
        self.shared
            .count_execution_logs(committed)
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Latest recorded log per job across both buckets; used to seed the
    /// processor's wheel after restarts and leadership changes.
    pub fn get_last_execution_log_for_job_ids(
        &self,
        job_ids: &[u64],
    ) -> Result<HashMap<u64, JobExecutionLog>, SchedulerError> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut latest: HashMap<u64, JobExecutionLog> = HashMap::new();
        for committed in [true, false] {
            for log in self.logs_for_job_ids(job_ids, committed)? {
                match latest.get(&log.job_id) {
                    Some(existing)
                        if (
                            existing.next_execution_datetime,
                            existing.execution_version,
                        ) >= (log.next_execution_datetime, log.execution_version) => {}
                    _ => {
                        latest.insert(log.job_id, log);
                    }
                }
            }
        }
        Ok(latest)
    }

    fn logs_for_job_ids(
        &self,
        job_ids: &[u64],
        committed: bool,
    ) -> Result<Vec<JobExecutionLog>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {} WHERE job_id IN ({})",
            shared_repo::executions_table(committed),
            placeholders(1, job_ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(job_ids.iter().map(|id| *id as i64)),
                execution_log_from_row,
            )
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// How many failed attempts are recorded for one fire identity.
    pub fn count_last_failed_execution_logs(
        &self,
        job_id: u64,
        node_id: NodeId,
        execution_version: u64,
    ) -> Result<u64, SchedulerError> {
        let conn = self.store.acquire();
        let mut total = 0u64;
        for committed in [true, false] {
            let sql = format!(
                "SELECT count(*) FROM {} \
                 WHERE job_id = ?1 AND node_id = ?2 AND execution_version = ?3 AND state = ?4",
                shared_repo::executions_table(committed)
            );
            let count: u64 = conn
                .query_row(
                    &sql,
                    params![
                        job_id,
                        node_id,
                        execution_version,
                        ExecutionState::Failed.as_str()
                    ],
                    |r| r.get(0),
                )
                .map_err(|e| SchedulerError::internal(e.to_string()))?;
            total += count;
        }
        Ok(total)
    }

    /// All uncommitted logs this node produced; the fan-in payload.
    pub fn get_uncommitted_executions_for_node(
        &self,
        node_id: NodeId,
    ) -> Result<Vec<JobExecutionLog>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {} WHERE node_id = ?1 ORDER BY id",
            shared_repo::executions_table(false)
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![node_id], execution_log_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Distinct execution records for a job across both buckets.
    pub fn count_by_job_id(&self, job_id: u64) -> Result<u64, SchedulerError> {
        let conn = self.store.acquire();
        let committed = shared_repo::executions_table(true);
        let uncommitted = shared_repo::executions_table(false);
        let sql = format!(
            "SELECT count(*) FROM ( \
               SELECT unique_id FROM {committed} WHERE job_id = ?1 \
               UNION \
               SELECT unique_id FROM {uncommitted} WHERE job_id = ?1 \
             )"
        );
        conn.query_row(&sql, params![job_id], |r| r.get(0))
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Execution history for a job: committed rows plus uncommitted rows not
    /// yet merged, newest first.
    pub fn list_by_job_id(
        &self,
        job_id: u64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<JobExecutionLog>, SchedulerError> {
        let conn = self.store.acquire();
        let committed = shared_repo::executions_table(true);
        let uncommitted = shared_repo::executions_table(false);
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM {committed} WHERE job_id = ?1 \
             UNION ALL \
             SELECT {EXECUTION_COLUMNS} FROM {uncommitted} \
             WHERE job_id = ?1 AND unique_id NOT IN \
               (SELECT unique_id FROM {committed} WHERE job_id = ?1) \
             ORDER BY date_created DESC LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![job_id, limit, offset], execution_log_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }
}
