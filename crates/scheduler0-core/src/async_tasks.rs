//! Async-task engine.
//!
//! Converts long-running client writes into durable, idempotent, replicated
//! work items. Handlers are looked up in a registry keyed by service name;
//! the leader's dispatcher claims `not_started` tasks with a replicated
//! compare-and-set so a handler runs at most once across the cluster.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use scheduler0_commons::models::{AsyncTask, AsyncTaskState};
use scheduler0_commons::SchedulerError;
use scheduler0_raft::{FsmEvent, SchedulerFsm};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::repos::AsyncTaskRepo;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<String, SchedulerError>> + Send>>;

/// `input -> output` for one service kind. Outputs are stored verbatim on the
/// task row.
pub type AsyncTaskHandler = Arc<dyn Fn(String) -> HandlerFuture + Send + Sync>;

pub struct AsyncTaskService {
    repo: Arc<AsyncTaskRepo>,
    fsm: Arc<SchedulerFsm>,
    handlers: RwLock<HashMap<String, AsyncTaskHandler>>,
    waiters: DashMap<u64, oneshot::Sender<AsyncTask>>,
    concurrency: Arc<Semaphore>,
}

impl AsyncTaskService {
    pub fn new(repo: Arc<AsyncTaskRepo>, fsm: Arc<SchedulerFsm>, concurrency: usize) -> Arc<Self> {
        Arc::new(Self {
            repo,
            fsm,
            handlers: RwLock::new(HashMap::new()),
            waiters: DashMap::new(),
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
        })
    }

    /// Register the handler for a service name. Called once at startup;
    /// unknown service names fail validation at the API edge.
    pub fn register_handler(&self, service: &str, handler: AsyncTaskHandler) {
        self.handlers.write().insert(service.to_string(), handler);
    }

    pub fn known_service(&self, service: &str) -> bool {
        self.handlers.read().contains_key(service)
    }

    pub fn repo(&self) -> &Arc<AsyncTaskRepo> {
        &self.repo
    }

    /// Create tasks, deduplicating on `(request_id, service)`. Returns the
    /// committed ids (the existing ids when the pair was seen before).
    pub async fn add_tasks(
        &self,
        input: &str,
        request_id: &str,
        service: &str,
    ) -> Result<Vec<u64>, SchedulerError> {
        if request_id.is_empty() {
            return Err(SchedulerError::validation("requestId field is required"));
        }
        if !self.known_service(service) {
            return Err(SchedulerError::validation(format!(
                "unknown service {service:?}"
            )));
        }
        // Same idempotency key with a different payload is a conflict, not a
        // silent dedupe.
        if let Some(existing) = self.repo.get_committed_by_request_id(request_id, service)? {
            if existing.input != input {
                return Err(SchedulerError::conflict(format!(
                    "request {request_id:?} was already submitted with a different payload"
                )));
            }
            return Ok(vec![existing.id]);
        }
        self.repo.create(input, request_id, service).await
    }

    /// A channel that yields the task exactly once, at its next terminal
    /// transition. Resolves immediately when the task is already terminal.
    /// Dropping the receiver cancels the wait.
    pub fn get_task_blocking(
        &self,
        task_id: u64,
    ) -> Result<oneshot::Receiver<AsyncTask>, SchedulerError> {
        let (tx, rx) = oneshot::channel();

        let task = self
            .repo
            .get_by_id(task_id)?
            .ok_or_else(|| SchedulerError::not_found(format!("task {task_id} does not exist")))?;
        if task.state.is_terminal() {
            let _ = tx.send(task);
            return Ok(rx);
        }

        self.waiters.insert(task_id, tx);
        // The task may have settled between the read and the insert; re-check
        // so the waiter cannot be stranded.
        if let Some(task) = self.repo.get_by_id(task_id)? {
            if task.state.is_terminal() {
                if let Some((_, tx)) = self.waiters.remove(&task_id) {
                    let _ = tx.send(task);
                }
            }
        }
        Ok(rx)
    }

    pub fn get_task_with_request_id_non_blocking(
        &self,
        request_id: &str,
    ) -> Result<Vec<AsyncTask>, SchedulerError> {
        self.repo.list_by_request_id(request_id)
    }

    /// Resolve parked `get_task_blocking` callers. Runs on every node so
    /// followers' callers unblock when the transition replicates.
    pub async fn run_notifier(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.fsm.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    let Ok(FsmEvent::AsyncTasksTransitioned { task_ids, state }) = event else {
                        continue;
                    };
                    if !state.is_terminal() {
                        continue;
                    }
                    for task_id in task_ids {
                        let Some((_, tx)) = self.waiters.remove(&task_id) else {
                            continue;
                        };
                        match self.repo.get_by_id(task_id) {
                            Ok(Some(task)) => {
                                let _ = tx.send(task);
                            }
                            Ok(None) => {}
                            Err(e) => log::error!("failed to load settled task {task_id}: {e}"),
                        }
                    }
                }
            }
        }
    }

    /// The leader's dispatcher: claim `not_started` tasks, run their handler,
    /// write the terminal state. Stops when the leader scope is cancelled.
    pub async fn listen_for_notifications(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.fsm.subscribe();
        loop {
            if let Err(e) = self.dispatch_pending(&cancel).await {
                log::warn!("async task dispatch sweep failed: {e}");
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
                event = events.recv() => {
                    // A created task wakes the dispatcher immediately.
                    if !matches!(event, Ok(FsmEvent::AsyncTasksCreated { .. })) {
                        continue;
                    }
                }
            }
        }
    }

    async fn dispatch_pending(&self, cancel: &CancellationToken) -> Result<(), SchedulerError> {
        let pending = self.repo.get_not_started()?;
        for task in pending {
            if cancel.is_cancelled() {
                return Ok(());
            }

            // Replicated CAS: only the node that flips not_started wins.
            let claimed = self
                .repo
                .update_state(
                    vec![task.id],
                    AsyncTaskState::InProgress,
                    None,
                    Some(AsyncTaskState::NotStarted),
                )
                .await?;
            if claimed == 0 {
                continue;
            }

            let handler = self.handlers.read().get(&task.service).cloned();
            let repo = self.repo.clone();
            let permit = self
                .concurrency
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SchedulerError::unavailable(e.to_string()))?;
            tokio::spawn(async move {
                let _permit = permit;
                let result = match handler {
                    Some(handler) => handler(task.input.clone()).await,
                    None => Err(SchedulerError::validation(format!(
                        "no handler registered for service {:?}",
                        task.service
                    ))),
                };
                let (state, output) = match result {
                    Ok(output) => (AsyncTaskState::Success, output),
                    Err(e) => {
                        log::warn!("async task {} failed: {e}", task.id);
                        (AsyncTaskState::Failed, e.to_string())
                    }
                };
                if let Err(e) = repo
                    .update_state(vec![task.id], state, Some(output), None)
                    .await
                {
                    log::error!("failed to settle async task {}: {e}", task.id);
                }
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for AsyncTaskService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTaskService")
            .field("waiters", &self.waiters.len())
            .finish_non_exhaustive()
    }
}
