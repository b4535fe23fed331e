//! Job executor.
//!
//! Drains a bounded queue of fire events with a fixed worker pool. Each fire
//! writes a `scheduled` log before dispatch and settles it to `success` or
//! `failed` by `unique_id` after the callback (with retries) resolves. Under
//! backpressure the oldest queued event is dropped and recorded as a
//! `queue_overflow` entry, never silently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use scheduler0_commons::models::{ExecutionState, Job, JobExecutionLog};
use scheduler0_commons::{Clock, NodeId};
use scheduler0_store::SharedRepo;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Where execution logs land.
///
/// A cluster of one (or a forced single-node deployment) writes straight to
/// the committed bucket; replicated mode writes locally and relies on fan-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    SingleNode,
    Replicated,
}

impl ExecutionMode {
    pub fn committed(&self) -> bool {
        matches!(self, ExecutionMode::SingleNode)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-attempt callback timeout (`T_cb`).
    pub callback_timeout: Duration,
    /// Total attempts per fire (`K`).
    pub max_attempts: u64,
    /// Queue depth (`Q`).
    pub queue_depth: usize,
    /// Worker pool size (`W`).
    pub workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            callback_timeout: Duration::from_secs(30),
            max_attempts: 3,
            queue_depth: 1024,
            workers: 4,
        }
    }
}

/// An upcoming (job, instant) pair to dispatch.
#[derive(Debug, Clone)]
pub struct FireEvent {
    pub job: Job,
    pub last_execution_datetime: DateTime<Utc>,
    pub next_execution_datetime: DateTime<Utc>,
    pub execution_version: u64,
    pub job_queue_version: u64,
}

struct Inner {
    queue: Mutex<VecDeque<FireEvent>>,
    notify: Notify,
    shared: SharedRepo,
    config: ExecutorConfig,
    mode: ExecutionMode,
    node_id: NodeId,
    clock: Arc<dyn Clock>,
    client: reqwest::Client,
}

impl Inner {
    fn build_log(&self, event: &FireEvent, state: ExecutionState, version: u64) -> JobExecutionLog {
        JobExecutionLog {
            id: 0,
            unique_id: JobExecutionLog::compute_unique_id(
                event.job.id,
                event.next_execution_datetime,
                self.node_id,
                event.execution_version,
            ),
            state,
            node_id: self.node_id,
            last_execution_datetime: event.last_execution_datetime,
            next_execution_datetime: event.next_execution_datetime,
            job_id: event.job.id,
            execution_version: version,
            job_queue_version: event.job_queue_version,
            date_created: self.clock.now(),
        }
    }

    fn record(&self, log: &JobExecutionLog) {
        if let Err(e) = self
            .shared
            .insert_execution_logs(self.mode.committed(), std::slice::from_ref(log))
        {
            log::error!("failed to record execution log for job {}: {e}", log.job_id);
        }
    }

    fn settle(&self, unique_id: &str, state: ExecutionState, version: u64) {
        if let Err(e) =
            self.shared
                .update_execution_log_state(self.mode.committed(), unique_id, state, version)
        {
            log::error!("failed to settle execution log {unique_id}: {e}");
        }
    }

    /// Dispatch one fire: scheduled log, callback with retries, terminal log.
    async fn execute(&self, event: FireEvent) {
        let scheduled = self.build_log(&event, ExecutionState::Scheduled, event.execution_version);
        self.record(&scheduled);

        let mut version = event.execution_version;
        let mut attempt = 0u64;
        let outcome = loop {
            version = event.execution_version + attempt;
            match self
                .client
                .post(&event.job.callback_url)
                .timeout(self.config.callback_timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(event.job.data.clone())
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => break ExecutionState::Success,
                Ok(response) => {
                    log::warn!(
                        "callback for job {} returned {} (attempt {})",
                        event.job.id,
                        response.status(),
                        attempt + 1
                    );
                }
                Err(e) => {
                    log::warn!(
                        "callback for job {} failed: {e} (attempt {})",
                        event.job.id,
                        attempt + 1
                    );
                }
            }

            attempt += 1;
            if attempt >= self.config.max_attempts {
                break ExecutionState::Failed;
            }
            tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow((attempt - 1) as u32)).await;
        };

        self.settle(&scheduled.unique_id, outcome, version);
        log::debug!(
            "job {} fire at {} settled as {:?} (execution version {})",
            event.job.id,
            event.next_execution_datetime,
            outcome,
            version
        );
    }
}

/// Producer-side handle; owned by the processor.
#[derive(Clone)]
pub struct ExecutorHandle {
    inner: Arc<Inner>,
}

impl ExecutorHandle {
    /// Enqueue a fire event. When the queue is at depth, the oldest event is
    /// dropped in arrival order and recorded as `queue_overflow`.
    pub fn submit(&self, event: FireEvent) {
        let dropped = {
            let mut queue = self.inner.queue.lock();
            let dropped = if queue.len() >= self.inner.config.queue_depth {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            dropped
        };

        if let Some(dropped) = dropped {
            log::warn!(
                "executor queue overflow: dropping fire for job {} at {}",
                dropped.job.id,
                dropped.next_execution_datetime
            );
            let log = self.inner.build_log(
                &dropped,
                ExecutionState::QueueOverflow,
                dropped.execution_version,
            );
            self.inner.record(&log);
        }

        self.inner.notify.notify_one();
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

pub struct JobExecutor {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

impl JobExecutor {
    pub fn new(
        shared: SharedRepo,
        config: ExecutorConfig,
        mode: ExecutionMode,
        node_id: NodeId,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                shared,
                config,
                mode,
                node_id,
                clock,
                client: reqwest::Client::new(),
            }),
            cancel,
        }
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            inner: self.inner.clone(),
        }
    }

    /// Start the worker pool. Workers run until the cancellation scope closes.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.workers)
            .map(|_| {
                let inner = self.inner.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let event = inner.queue.lock().pop_front();
                        match event {
                            Some(event) => inner.execute(event).await,
                            None => {
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = inner.notify.notified() => {}
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scheduler0_commons::ManualClock;
    use scheduler0_store::SqliteStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn event(job_id: u64, callback_url: &str) -> FireEvent {
        FireEvent {
            job: Job {
                id: job_id,
                project_id: 1,
                spec: "* * * * * *".into(),
                timezone: "UTC".into(),
                callback_url: callback_url.into(),
                data: "{}".into(),
                start_date: None,
                end_date: None,
                date_created: at(),
            },
            last_execution_datetime: at(),
            next_execution_datetime: at() + chrono::Duration::seconds(job_id as i64),
            execution_version: 1,
            job_queue_version: 1,
        }
    }

    fn executor(config: ExecutorConfig, mode: ExecutionMode) -> (JobExecutor, SharedRepo) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let shared = SharedRepo::new(store);
        let executor = JobExecutor::new(
            shared.clone(),
            config,
            mode,
            1,
            ManualClock::new(at()),
            CancellationToken::new(),
        );
        (executor, shared)
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_records_it() {
        let (executor, shared) = executor(
            ExecutorConfig {
                queue_depth: 2,
                ..Default::default()
            },
            ExecutionMode::Replicated,
        );
        let handle = executor.handle();

        handle.submit(event(1, "http://127.0.0.1:1/cb"));
        handle.submit(event(2, "http://127.0.0.1:1/cb"));
        handle.submit(event(3, "http://127.0.0.1:1/cb"));

        assert_eq!(handle.queue_len(), 2);

        let logs = shared.get_execution_logs(false).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].state, ExecutionState::QueueOverflow);
        assert_eq!(logs[0].job_id, 1);

        // The survivors are the later arrivals, still in order.
        let remaining: Vec<u64> = executor
            .inner
            .queue
            .lock()
            .iter()
            .map(|e| e.job.id)
            .collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    /// Minimal one-shot HTTP server answering 200 with an empty body.
    async fn serve_one_ok() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        format!("http://{addr}/cb")
    }

    #[tokio::test]
    async fn successful_callback_settles_success() {
        let url = serve_one_ok().await;
        let (executor, shared) = executor(ExecutorConfig::default(), ExecutionMode::Replicated);

        executor.inner.execute(event(7, &url)).await;

        let logs = shared.get_execution_logs(false).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].state, ExecutionState::Success);
        assert_eq!(logs[0].execution_version, 1);
    }

    #[tokio::test]
    async fn unreachable_callback_settles_failed_after_retries() {
        let (executor, shared) = executor(
            ExecutorConfig {
                max_attempts: 2,
                callback_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            ExecutionMode::Replicated,
        );

        executor.inner.execute(event(9, "http://127.0.0.1:1/cb")).await;

        let logs = shared.get_execution_logs(false).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].state, ExecutionState::Failed);
        // Base version 1 plus one retry.
        assert_eq!(logs[0].execution_version, 2);
    }

    #[tokio::test]
    async fn single_node_mode_writes_to_the_committed_bucket() {
        let url = serve_one_ok().await;
        let (executor, shared) = executor(ExecutorConfig::default(), ExecutionMode::SingleNode);

        executor.inner.execute(event(4, &url)).await;

        assert_eq!(shared.count_execution_logs(true).unwrap(), 1);
        assert_eq!(shared.count_execution_logs(false).unwrap(), 0);
    }
}
