//! Raft actions: the single write path into the replicated log.
//!
//! Every domain write funnels through [`RaftActions::write`]: serialize the
//! command, submit it to the leader's log, block until apply, decode the
//! per-command result. Non-leader callers get `NotLeader` immediately with
//! the leader's client address as a redirect hint.

use std::time::Duration;

use chrono::{DateTime, Utc};
use openraft::error::{ClientWriteError, RaftError as OpenraftError};
use scheduler0_commons::models::{AsyncTask, AsyncTaskState, JobExecutionLog, LocalData, NodeRange};

use crate::command::{decode, encode, AsyncTaskCommand, Command, CommandResponse, SqlValue};
use crate::error::RaftError;
use crate::types::{NodeId, Raft};

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RaftActions {
    raft: Raft,
    node_id: NodeId,
}

impl RaftActions {
    pub fn new(raft: Raft, node_id: NodeId) -> Self {
        Self { raft, node_id }
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn is_leader(&self) -> bool {
        let metrics = self.raft.metrics().borrow().clone();
        metrics.current_leader == Some(self.node_id)
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Client-facing address of the current leader, for 301 redirects.
    pub fn leader_http_address(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader_id = metrics.current_leader?;
        let address = metrics
            .membership_config
            .nodes()
            .find(|(id, _)| **id == leader_id)
            .map(|(_, node)| node.http_address.clone());
        address
    }

    /// Submit a command and wait for apply.
    pub async fn write(&self, command: Command) -> Result<CommandResponse, RaftError> {
        if !self.is_leader() {
            return Err(RaftError::not_leader(self.leader_http_address()));
        }

        let bytes = encode(&command)?;
        let write = tokio::time::timeout(WRITE_TIMEOUT, self.raft.client_write(bytes));
        match write.await {
            Err(_) => Err(RaftError::Timeout(WRITE_TIMEOUT)),
            Ok(Ok(response)) => decode(&response.data),
            Ok(Err(OpenraftError::APIError(ClientWriteError::ForwardToLeader(forward)))) => {
                Err(RaftError::not_leader(
                    forward.leader_node.map(|node| node.http_address),
                ))
            }
            Ok(Err(OpenraftError::APIError(other))) => Err(RaftError::Proposal(other.to_string())),
            Ok(Err(OpenraftError::Fatal(fatal))) => Err(RaftError::Shutdown(fatal.to_string())),
        }
    }

    /// Arbitrary parameterized mutation (the `DbExecute` kind).
    pub async fn write_db_command(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlValue>,
    ) -> Result<CommandResponse, RaftError> {
        self.write(Command::DbExecute {
            sql: sql.into(),
            params,
        })
        .await
    }

    /// Publish a job-queue allocation; returns the committed version.
    pub async fn publish_job_queue(
        &self,
        number_of_active_nodes: u64,
        ranges: Vec<NodeRange>,
        date_created: DateTime<Utc>,
    ) -> Result<u64, RaftError> {
        let response = self
            .write(Command::JobQueue {
                number_of_active_nodes,
                ranges,
                date_created,
            })
            .await?;
        Ok(response.last_inserted_id)
    }

    /// Create async tasks; returns the committed task ids (existing ids for
    /// deduplicated requests).
    pub async fn create_async_tasks(&self, tasks: Vec<AsyncTask>) -> Result<Vec<u64>, RaftError> {
        let response = self
            .write(Command::AsyncTask(AsyncTaskCommand::Create { tasks }))
            .await?;
        Ok(response.task_ids)
    }

    /// Transition async tasks; returns how many rows actually changed (zero
    /// means a compare-and-set claim was lost).
    pub async fn update_async_tasks(
        &self,
        task_ids: Vec<u64>,
        state: AsyncTaskState,
        output: Option<String>,
        expected_state: Option<AsyncTaskState>,
    ) -> Result<u64, RaftError> {
        let response = self
            .write(Command::AsyncTask(AsyncTaskCommand::UpdateState {
                task_ids,
                state,
                output,
                expected_state,
            }))
            .await?;
        Ok(response.rows_affected)
    }

    /// Batch-commit fanned-in execution logs.
    pub async fn commit_execution_logs(
        &self,
        logs: Vec<JobExecutionLog>,
    ) -> Result<u64, RaftError> {
        let response = self.write(Command::ExecutionLogs { logs }).await?;
        Ok(response.rows_affected)
    }

    /// Commit a peer's compound local-data payload.
    pub async fn commit_local_data(&self, data: LocalData) -> Result<u64, RaftError> {
        let response = self.write(Command::LocalData { data }).await?;
        Ok(response.rows_affected)
    }
}

impl std::fmt::Debug for RaftActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftActions")
            .field("node_id", &self.node_id)
            .finish()
    }
}
