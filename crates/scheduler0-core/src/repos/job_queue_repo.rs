//! Job-queue repository.
//!
//! The allocation write path is a single `JobQueue` command that bumps the
//! version and inserts every range row atomically, which is what keeps the
//! "ranges at a version partition the job-id space" invariant intact.

use std::sync::Arc;

use rusqlite::params;
use scheduler0_commons::constants::{JOB_QUEUES_TABLE, JOB_QUEUE_VERSIONS_TABLE};
use scheduler0_commons::models::{JobQueueLog, NodeRange};
use scheduler0_commons::{Clock, NodeId, SchedulerError};
use scheduler0_raft::RaftActions;
use scheduler0_store::SqliteStore;

use super::job_queue_log_from_row;

const JOB_QUEUE_LOG_COLUMNS: &str =
    "id, node_id, lower_bound_job_id, upper_bound_job_id, version, date_created";

#[derive(Clone)]
pub struct JobQueueRepo {
    store: Arc<SqliteStore>,
    actions: Arc<RaftActions>,
    clock: Arc<dyn Clock>,
}

impl JobQueueRepo {
    pub fn new(store: Arc<SqliteStore>, actions: Arc<RaftActions>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            actions,
            clock,
        }
    }

    /// Current allocation epoch, 0 before any allocation was committed.
    pub fn get_last_version(&self) -> Result<u64, SchedulerError> {
        let conn = self.store.acquire();
        conn.query_row(
            &format!("SELECT COALESCE(MAX(version), 0) FROM {JOB_QUEUE_VERSIONS_TABLE}"),
            [],
            |r| r.get(0),
        )
        .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// The range a node holds at a version, when one was recorded.
    pub fn get_last_job_queue_log_for_node(
        &self,
        node_id: NodeId,
        version: u64,
    ) -> Result<Option<JobQueueLog>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {JOB_QUEUE_LOG_COLUMNS} FROM {JOB_QUEUES_TABLE} \
             WHERE node_id = ?1 AND version = ?2 ORDER BY id DESC LIMIT 1"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![node_id, version], job_queue_log_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(log) => Ok(Some(log.map_err(|e| SchedulerError::internal(e.to_string()))?)),
            None => Ok(None),
        }
    }

    pub fn get_job_queue_logs_for_version(
        &self,
        version: u64,
    ) -> Result<Vec<JobQueueLog>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {JOB_QUEUE_LOG_COLUMNS} FROM {JOB_QUEUES_TABLE} \
             WHERE version = ?1 ORDER BY node_id"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![version], job_queue_log_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Range rows produced by one apply, identified by the insert result.
    pub fn get_job_queue_by_last_inserted_and_rows_affected(
        &self,
        last_inserted_id: u64,
        rows_affected: u64,
    ) -> Result<Vec<JobQueueLog>, SchedulerError> {
        if rows_affected == 0 {
            return Ok(Vec::new());
        }
        let first = last_inserted_id + 1 - rows_affected;
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {JOB_QUEUE_LOG_COLUMNS} FROM {JOB_QUEUES_TABLE} \
             WHERE id >= ?1 AND id <= ?2 ORDER BY id"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![first, last_inserted_id], job_queue_log_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Publish an allocation epoch; returns the committed version.
    pub async fn publish_allocation(
        &self,
        number_of_active_nodes: u64,
        ranges: Vec<NodeRange>,
    ) -> Result<u64, SchedulerError> {
        let version = self
            .actions
            .publish_job_queue(number_of_active_nodes, ranges, self.clock.now())
            .await?;
        Ok(version)
    }
}
