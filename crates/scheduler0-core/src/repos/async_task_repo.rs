//! Async-task repository.
//!
//! Committed tasks are the replicated work items the dispatcher drains;
//! uncommitted tasks are node-local (the peer fan-in collector and writes
//! accepted while this node could not reach the leader).

use std::sync::Arc;

use rusqlite::params;
use scheduler0_commons::models::{AsyncTask, AsyncTaskState};
use scheduler0_commons::{Clock, SchedulerError};
use scheduler0_raft::RaftActions;
use scheduler0_store::shared_repo::{self, async_task_from_row};
use scheduler0_store::{SharedRepo, SqliteStore};

use super::placeholders;

const TASK_COLUMNS: &str = "id, request_id, service, input, output, state, date_created";

#[derive(Clone)]
pub struct AsyncTaskRepo {
    store: Arc<SqliteStore>,
    shared: SharedRepo,
    actions: Arc<RaftActions>,
    clock: Arc<dyn Clock>,
}

impl AsyncTaskRepo {
    pub fn new(
        store: Arc<SqliteStore>,
        shared: SharedRepo,
        actions: Arc<RaftActions>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            shared,
            actions,
            clock,
        }
    }

    /// Create replicated tasks; returns committed ids (existing ids when the
    /// `(request_id, service)` pair was already present).
    pub async fn create(
        &self,
        input: &str,
        request_id: &str,
        service: &str,
    ) -> Result<Vec<u64>, SchedulerError> {
        let task = AsyncTask {
            id: 0,
            request_id: request_id.to_string(),
            service: service.to_string(),
            input: input.to_string(),
            output: String::new(),
            state: AsyncTaskState::NotStarted,
            date_created: self.clock.now(),
        };
        let ids = self.actions.create_async_tasks(vec![task]).await?;
        Ok(ids)
    }

    /// Replay a batch of existing (usually uncommitted) tasks into the
    /// replicated bucket.
    pub async fn replay(&self, tasks: Vec<AsyncTask>) -> Result<Vec<u64>, SchedulerError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.actions.create_async_tasks(tasks).await?;
        Ok(ids)
    }

    /// Create a node-local task (never replicated).
    pub fn create_local(
        &self,
        input: &str,
        request_id: &str,
        service: &str,
    ) -> Result<AsyncTask, SchedulerError> {
        let task = AsyncTask {
            id: 0,
            request_id: request_id.to_string(),
            service: service.to_string(),
            input: input.to_string(),
            output: String::new(),
            state: AsyncTaskState::NotStarted,
            date_created: self.clock.now(),
        };
        self.shared
            .insert_async_tasks(false, &[task])
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        self.get_local_by_request_id(request_id, service)?
            .ok_or_else(|| SchedulerError::internal("created local task not found"))
    }

    /// The committed task for one `(request_id, service)` pair, if any.
    pub fn get_committed_by_request_id(
        &self,
        request_id: &str,
        service: &str,
    ) -> Result<Option<AsyncTask>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE request_id = ?1 AND service = ?2",
            shared_repo::async_tasks_table(true)
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![request_id, service], async_task_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(task) => Ok(Some(task.map_err(|e| SchedulerError::internal(e.to_string()))?)),
            None => Ok(None),
        }
    }

    pub fn get_local_by_request_id(
        &self,
        request_id: &str,
        service: &str,
    ) -> Result<Option<AsyncTask>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE request_id = ?1 AND service = ?2",
            shared_repo::async_tasks_table(false)
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let mut rows = stmt
            .query_map(params![request_id, service], async_task_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        match rows.next() {
            Some(task) => Ok(Some(task.map_err(|e| SchedulerError::internal(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// Look a task up by id: replicated bucket first, then node-local.
    pub fn get_by_id(&self, id: u64) -> Result<Option<AsyncTask>, SchedulerError> {
        for committed in [true, false] {
            if let Some(task) = self
                .shared
                .get_task_by_id(committed, id)
                .map_err(|e| SchedulerError::internal(e.to_string()))?
            {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    pub fn get_by_ids(&self, ids: &[u64]) -> Result<Vec<AsyncTask>, SchedulerError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE id IN ({}) ORDER BY id",
            shared_repo::async_tasks_table(true),
            placeholders(1, ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(ids.iter().map(|id| *id as i64)),
                async_task_from_row,
            )
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    pub fn list_by_request_id(&self, request_id: &str) -> Result<Vec<AsyncTask>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE request_id = ?1 ORDER BY id",
            shared_repo::async_tasks_table(true)
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(params![request_id], async_task_from_row)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Replicated tasks the dispatcher has not claimed yet.
    pub fn get_not_started(&self) -> Result<Vec<AsyncTask>, SchedulerError> {
        let conn = self.store.acquire();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM {} WHERE state = ?1 ORDER BY id",
            shared_repo::async_tasks_table(true)
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        let rows = stmt
            .query_map(
                params![AsyncTaskState::NotStarted.as_str()],
                async_task_from_row,
            )
            .map_err(|e| SchedulerError::internal(e.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    pub fn get_uncommitted(&self) -> Result<Vec<AsyncTask>, SchedulerError> {
        self.shared
            .get_uncommitted_tasks()
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }

    /// Replicated state transition; `expected_state` makes it a
    /// compare-and-set and the returned count tells the caller whether it won.
    pub async fn update_state(
        &self,
        task_ids: Vec<u64>,
        state: AsyncTaskState,
        output: Option<String>,
        expected_state: Option<AsyncTaskState>,
    ) -> Result<u64, SchedulerError> {
        let affected = self
            .actions
            .update_async_tasks(task_ids, state, output, expected_state)
            .await?;
        Ok(affected)
    }

    /// Node-local state transition for the fan-in collector.
    pub fn update_local(
        &self,
        id: u64,
        state: AsyncTaskState,
        output: Option<&str>,
    ) -> Result<u64, SchedulerError> {
        self.shared
            .update_uncommitted_task(id, state, output)
            .map_err(|e| SchedulerError::internal(e.to_string()))
    }
}
