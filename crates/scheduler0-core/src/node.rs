//! Node coordinator.
//!
//! Watches leadership, starts and stops the scheduling machinery, runs the
//! uncommitted-log fan-in when this node takes over as leader, and owns the
//! cancellation scope every background loop hangs off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use scheduler0_commons::constants::SERVICE_LOCAL_DATA;
use scheduler0_commons::models::{
    AsyncTask, AsyncTaskState, LocalData, PeerFanIn, PeerFanInState, Replica,
};
use scheduler0_commons::{Clock, NodeId, SchedulerError};
use scheduler0_raft::RaftActions;
use tokio_util::sync::CancellationToken;

use crate::allocator::JobQueueAllocator;
use crate::async_tasks::AsyncTaskService;
use crate::peer_client::PeerClient;
use crate::repos::{AsyncTaskRepo, ExecutionsRepo};

#[derive(Debug, Clone)]
pub struct NodeCoordinatorConfig {
    pub node_id: NodeId,
    pub replicas: Vec<Replica>,
    /// Fan-in concurrency (`F`). Zero keeps the accept-writes gate closed
    /// forever on leadership changes; only meaningful for testing.
    pub fan_in: usize,
    /// Sweep interval for fan-in and the dispatcher.
    pub fetch_interval: Duration,
    /// Per-attempt fan-in deadline (`T_fi`).
    pub fan_in_timeout: Duration,
    /// Grace the shutdown path waits for loops to drain (`T_drain`).
    pub drain_timeout: Duration,
}

impl NodeCoordinatorConfig {
    pub fn is_single_node(&self) -> bool {
        self.replicas.len() <= 1
    }

    /// HTTP addresses of every configured peer but this node.
    pub fn peer_addresses(&self) -> Vec<String> {
        self.replicas
            .iter()
            .filter(|replica| replica.node_id != self.node_id)
            .map(|replica| replica.address.clone())
            .collect()
    }
}

pub struct NodeCoordinator {
    config: NodeCoordinatorConfig,
    actions: Arc<RaftActions>,
    allocator: JobQueueAllocator,
    async_service: Arc<AsyncTaskService>,
    executions_repo: Arc<ExecutionsRepo>,
    async_repo: Arc<AsyncTaskRepo>,
    peer_client: PeerClient,
    fan_ins: DashMap<String, PeerFanIn>,
    accept_writes: Arc<AtomicBool>,
    cancel: CancellationToken,
    leader_scope: Mutex<Option<CancellationToken>>,
    clock: Arc<dyn Clock>,
}

impl NodeCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NodeCoordinatorConfig,
        actions: Arc<RaftActions>,
        allocator: JobQueueAllocator,
        async_service: Arc<AsyncTaskService>,
        executions_repo: Arc<ExecutionsRepo>,
        async_repo: Arc<AsyncTaskRepo>,
        peer_client: PeerClient,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            actions,
            allocator,
            async_service,
            executions_repo,
            async_repo,
            peer_client,
            fan_ins: DashMap::new(),
            accept_writes: Arc::new(AtomicBool::new(false)),
            cancel,
            leader_scope: Mutex::new(None),
            clock,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.actions.is_leader()
    }

    pub fn leader_http_address(&self) -> Option<String> {
        self.actions.leader_http_address()
    }

    /// Whether client writes are currently accepted on this node.
    pub fn can_accept_writes(&self) -> bool {
        self.accept_writes.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the scope and give loops `T_drain` to wind down.
    pub async fn shutdown(&self) {
        log::info!("node coordinator shutting down");
        self.cancel.cancel();
        tokio::time::sleep(self.config.drain_timeout).await;
    }

    /// Main loop: resolve waiting task callers on every node, and react to
    /// leadership transitions.
    pub async fn run(self: Arc<Self>) {
        tokio::spawn(
            self.async_service
                .clone()
                .run_notifier(self.cancel.clone()),
        );

        let mut metrics = self.actions.raft().metrics();
        let mut was_leader = false;
        let mut known_voters: Vec<NodeId> = Vec::new();
        loop {
            let (is_leader, voters) = {
                let current = metrics.borrow().clone();
                let voters: Vec<NodeId> = current.membership_config.voter_ids().collect();
                (current.current_leader == Some(self.config.node_id), voters)
            };

            if is_leader && !was_leader {
                self.on_became_leader();
            } else if !is_leader && was_leader {
                self.on_became_follower();
            } else if is_leader && voters != known_voters && !known_voters.is_empty() {
                // The node set changed under a stable leadership; the ranges
                // must be recut.
                let coordinator = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = coordinator.trigger_allocation().await {
                        log::warn!("allocation after membership change failed: {e}");
                    }
                });
            }
            was_leader = is_leader;
            known_voters = voters;

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.on_became_follower();
                    return;
                }
                changed = metrics.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Leader takeover: fan in peers' local data, republish the allocation,
    /// replay locally-parked tasks, start the dispatcher, then open the gate.
    fn on_became_leader(self: &Arc<Self>) {
        log::info!("node {} became leader", self.config.node_id);
        let scope = self.cancel.child_token();
        *self.leader_scope.lock() = Some(scope.clone());

        let coordinator = self.clone();
        tokio::spawn(async move {
            if !coordinator.config.is_single_node() {
                coordinator.fan_in_until_complete(&scope).await;
                if scope.is_cancelled() {
                    return;
                }
                if let Err(e) = coordinator.replay_uncommitted_tasks().await {
                    log::warn!("failed to replay uncommitted async tasks: {e}");
                }
            }

            if let Err(e) = coordinator.trigger_allocation().await {
                log::warn!("allocation on leadership change failed: {e}");
            }

            tokio::spawn(
                coordinator
                    .async_service
                    .clone()
                    .listen_for_notifications(scope.clone()),
            );

            coordinator.accept_writes.store(true, Ordering::SeqCst);
            log::info!("node {} now accepts client writes", coordinator.config.node_id);
        });
    }

    /// Stepping down stops the leader-only machinery; the processor and
    /// executor keep firing this node's currently assigned range.
    fn on_became_follower(&self) {
        if let Some(scope) = self.leader_scope.lock().take() {
            log::info!("node {} stepped down from leadership", self.config.node_id);
            scope.cancel();
        }
        self.accept_writes.store(false, Ordering::SeqCst);
        self.fan_ins.clear();
    }

    /// Recompute and publish the job-queue allocation over the live voter
    /// set. Also invoked after batch job inserts.
    pub async fn trigger_allocation(&self) -> Result<u64, SchedulerError> {
        let mut node_ids: Vec<NodeId> = {
            let metrics = self.actions.raft().metrics().borrow().clone();
            metrics.membership_config.voter_ids().collect()
        };
        if node_ids.is_empty() {
            node_ids.push(self.config.node_id);
        }
        self.allocator.allocate(&node_ids).await
    }

    // ------------------------------------------------------------------
    // Fan-in (leader side)
    // ------------------------------------------------------------------

    /// Sweep until every configured peer has fanned in its local data.
    async fn fan_in_until_complete(&self, scope: &CancellationToken) {
        let peers = self.config.peer_addresses();
        if peers.is_empty() {
            return;
        }
        for peer in &peers {
            self.fan_ins.entry(peer.clone()).or_insert_with(|| PeerFanIn {
                peer_http_address: peer.clone(),
                ..Default::default()
            });
        }

        loop {
            if scope.is_cancelled() {
                return;
            }
            self.fan_in_sweep().await;

            let complete = peers.iter().all(|peer| {
                self.fan_ins
                    .get(peer)
                    .map(|f| f.state == PeerFanInState::Complete)
                    .unwrap_or(false)
            });
            if complete {
                log::info!("fan-in complete for all {} peers", peers.len());
                return;
            }

            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(self.config.fetch_interval) => {}
            }
        }
    }

    async fn fan_in_sweep(&self) {
        // Phase 2/3 first: poll peers that already handed us a task id.
        let polling: Vec<PeerFanIn> = self
            .fan_ins
            .iter()
            .filter(|entry| entry.state == PeerFanInState::GetRequestId)
            .map(|entry| entry.value().clone())
            .collect();
        for fan_in in polling {
            self.poll_peer(fan_in).await;
        }

        // Phase 1: pick up to F fresh peers, randomly.
        let in_flight = self
            .fan_ins
            .iter()
            .filter(|entry| entry.state == PeerFanInState::GetRequestId)
            .count();
        let budget = self.config.fan_in.saturating_sub(in_flight);
        if budget == 0 {
            return;
        }

        let mut candidates: Vec<String> = self
            .fan_ins
            .iter()
            .filter(|entry| {
                matches!(
                    entry.state,
                    PeerFanInState::NotStarted | PeerFanInState::Failed
                )
            })
            .map(|entry| entry.key().clone())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());

        for peer in candidates.into_iter().take(budget) {
            self.start_fan_in(peer).await;
        }
    }

    async fn start_fan_in(&self, peer: String) {
        let request_id = uuid::Uuid::new_v4().to_string();
        match self
            .peer_client
            .get_uncommitted_logs(&peer, &request_id, self.config.fan_in_timeout)
            .await
        {
            Ok(task_id) => {
                log::debug!("fan-in request {request_id} accepted by {peer} as task {task_id}");
                self.fan_ins.insert(
                    peer.clone(),
                    PeerFanIn {
                        peer_http_address: peer,
                        state: PeerFanInState::GetRequestId,
                        request_id,
                        async_task_id: task_id,
                        started_at: Some(self.clock.now()),
                    },
                );
            }
            Err(e) => {
                log::warn!("fan-in request to {peer} failed: {e}");
                self.mark_fan_in(&peer, PeerFanInState::Failed);
            }
        }
    }

    async fn poll_peer(&self, fan_in: PeerFanIn) {
        let peer = fan_in.peer_http_address.clone();
        match self
            .peer_client
            .get_async_task(&peer, fan_in.async_task_id, self.config.fan_in_timeout)
            .await
        {
            Ok(task) if task.state == AsyncTaskState::Success => {
                match serde_json::from_str::<LocalData>(&task.output) {
                    Ok(data) => {
                        if let Err(e) = self.commit_local_data(&peer, data).await {
                            log::warn!("committing fan-in data from {peer} failed: {e}");
                            self.mark_fan_in(&peer, PeerFanInState::Failed);
                        } else {
                            self.mark_fan_in(&peer, PeerFanInState::Complete);
                        }
                    }
                    Err(e) => {
                        log::warn!("peer {peer} returned an undecodable payload: {e}");
                        self.mark_fan_in(&peer, PeerFanInState::Failed);
                    }
                }
            }
            Ok(task) if task.state == AsyncTaskState::Failed => {
                log::warn!("peer {peer} failed to collect local data");
                self.mark_fan_in(&peer, PeerFanInState::Failed);
            }
            Ok(_) => {
                // Still in flight; poll again next sweep unless past deadline.
                if let Some(started) = fan_in.started_at {
                    let elapsed = self.clock.now() - started;
                    if elapsed.to_std().unwrap_or_default() > self.config.fan_in_timeout {
                        log::warn!("fan-in to {peer} timed out; re-selecting later");
                        self.mark_fan_in(&peer, PeerFanInState::Failed);
                    }
                }
            }
            Err(e) => {
                log::warn!("polling fan-in task on {peer} failed: {e}");
                self.mark_fan_in(&peer, PeerFanInState::Failed);
            }
        }
    }

    fn mark_fan_in(&self, peer: &str, state: PeerFanInState) {
        if let Some(mut entry) = self.fan_ins.get_mut(peer) {
            entry.state = state;
        }
    }

    /// Phase 3: merge one peer's payload through the replicated log.
    async fn commit_local_data(&self, peer: &str, data: LocalData) -> Result<(), SchedulerError> {
        if data.is_empty() {
            log::debug!("peer {peer} had no local data to merge");
            return Ok(());
        }
        log::info!(
            "merging {} execution logs and {} async tasks from {peer}",
            data.execution_logs.len(),
            data.async_tasks.len()
        );
        self.actions.commit_local_data(data).await?;
        Ok(())
    }

    /// Replay async tasks this node accepted while partitioned from the
    /// leader into the replicated bucket.
    async fn replay_uncommitted_tasks(&self) -> Result<(), SchedulerError> {
        let tasks: Vec<AsyncTask> = self
            .async_repo
            .get_uncommitted()?
            .into_iter()
            .filter(|task| task.service != SERVICE_LOCAL_DATA && !task.state.is_terminal())
            .map(|task| AsyncTask {
                id: 0,
                state: AsyncTaskState::NotStarted,
                output: String::new(),
                ..task
            })
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }
        log::info!("replaying {} uncommitted async tasks", tasks.len());
        self.async_repo.replay(tasks).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fan-in (peer side, serving the new leader)
    // ------------------------------------------------------------------

    /// Serve `GET /peer/uncommitted-logs`: record a node-local collection
    /// task, fill it with this node's uncommitted data, return its id.
    pub fn serve_uncommitted_logs(&self, request_id: &str) -> Result<u64, SchedulerError> {
        if request_id.is_empty() {
            return Err(SchedulerError::validation("requestId field is required"));
        }

        let task = self
            .async_repo
            .create_local("", request_id, SERVICE_LOCAL_DATA)?;
        if task.state.is_terminal() {
            return Ok(task.id);
        }

        let data = LocalData {
            execution_logs: self
                .executions_repo
                .get_uncommitted_executions_for_node(self.config.node_id)?,
            async_tasks: self
                .async_repo
                .get_uncommitted()?
                .into_iter()
                .filter(|t| t.service != SERVICE_LOCAL_DATA)
                .collect(),
        };
        let output =
            serde_json::to_string(&data).map_err(|e| SchedulerError::internal(e.to_string()))?;
        self.async_repo
            .update_local(task.id, AsyncTaskState::Success, Some(&output))?;
        log::debug!(
            "collected {} execution logs and {} async tasks for fan-in request {request_id}",
            data.execution_logs.len(),
            data.async_tasks.len()
        );
        Ok(task.id)
    }

    /// Serve `GET /peer/async-task/{id}`.
    pub fn serve_async_task(&self, task_id: u64) -> Result<AsyncTask, SchedulerError> {
        self.async_repo
            .get_by_id(task_id)?
            .ok_or_else(|| SchedulerError::not_found(format!("task {task_id} does not exist")))
    }
}

impl std::fmt::Debug for NodeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCoordinator")
            .field("node_id", &self.config.node_id)
            .field("fan_ins", &self.fan_ins.len())
            .finish_non_exhaustive()
    }
}
