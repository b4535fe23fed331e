//! Shared application state handed to every handler.

use std::sync::Arc;

use scheduler0_commons::SchedulerError;
use scheduler0_core::repos::{
    AsyncTaskRepo, CredentialRepo, ExecutionsRepo, JobQueueRepo, JobRepo, ProjectRepo,
};
use scheduler0_core::{AsyncTaskService, NodeCoordinator};
use scheduler0_raft::Raft;

pub struct AppState {
    pub project_repo: Arc<ProjectRepo>,
    pub job_repo: Arc<JobRepo>,
    pub credential_repo: Arc<CredentialRepo>,
    pub executions_repo: Arc<ExecutionsRepo>,
    pub async_task_repo: Arc<AsyncTaskRepo>,
    pub job_queue_repo: Arc<JobQueueRepo>,
    pub async_service: Arc<AsyncTaskService>,
    pub coordinator: Arc<NodeCoordinator>,
    pub raft: Raft,
    /// Username/password pair peers authenticate with.
    pub peer_auth: (String, String),
}

impl AppState {
    /// Gate for client writes: leader only, and only once fan-in released the
    /// accept-writes flag.
    pub fn ensure_writable(&self) -> Result<(), SchedulerError> {
        if !self.coordinator.is_leader() {
            return Err(SchedulerError::NotLeader {
                leader_address: self.coordinator.leader_http_address(),
            });
        }
        if !self.coordinator.can_accept_writes() {
            return Err(SchedulerError::unavailable(
                "cluster is not accepting writes yet",
            ));
        }
        Ok(())
    }
}
