//! Server lifecycle: bootstrap the node's components, run the HTTP server,
//! and coordinate graceful shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use log::info;
use scheduler0_api::handlers::jobs::JobDraftPayload;
use scheduler0_api::AppState;
use scheduler0_commons::constants::SERVICE_BATCH_INSERT_JOBS;
use scheduler0_commons::{SchedulerError, SystemClock};
use scheduler0_core::repos::{
    AsyncTaskRepo, CredentialRepo, ExecutionsRepo, JobDraft, JobQueueRepo, JobRepo, ProjectRepo,
};
use scheduler0_core::{
    AsyncTaskService, ExecutionMode, ExecutorConfig, JobExecutor, JobProcessor, JobQueueAllocator,
    NodeCoordinator, NodeCoordinatorConfig, PeerClient,
};
use scheduler0_raft::{
    bootstrap_cluster, start_raft, HttpRaftNetwork, Node, RaftActions, RaftConfigOptions,
    SchedulerFsm, SchedulerRaftStorage,
};
use scheduler0_store::{SharedRepo, SqliteStore};
use tokio_util::sync::CancellationToken;

use crate::config::Scheduler0Config;
use crate::middleware;
use crate::routes;

/// Everything the HTTP server and the shutdown path share.
pub struct ApplicationComponents {
    pub state: web::Data<AppState>,
    pub coordinator: Arc<NodeCoordinator>,
}

/// Open the store, start raft, wire the repositories and scheduling
/// machinery, and kick off the background loops.
pub async fn bootstrap(config: &Scheduler0Config) -> Result<ApplicationComponents> {
    let store = Arc::new(
        SqliteStore::open(&config.sqlite_file_path)
            .with_context(|| format!("opening sqlite store at {}", config.sqlite_file_path))?,
    );
    info!("sqlite store ready at {}", config.sqlite_file_path);

    // Raft core over the store-backed state machine.
    let fsm = Arc::new(SchedulerFsm::new(store.clone()));
    let storage = Arc::new(SchedulerRaftStorage::new(fsm.clone()));
    let network = HttpRaftNetwork::new();
    for replica in &config.replicas {
        network.register_node(
            replica.node_id,
            Node {
                raft_address: replica.raft_address.clone(),
                http_address: replica.address.clone(),
            },
        );
    }

    let raft = start_raft(
        config.node_id,
        RaftConfigOptions::default(),
        network,
        storage,
    )
    .await
    .map_err(|e| anyhow::anyhow!("starting raft: {e}"))?;

    if config.bootstrap {
        let mut members = BTreeMap::new();
        if config.replicas.is_empty() {
            members.insert(
                config.node_id,
                Node {
                    raft_address: config.raft_address.clone(),
                    http_address: config.own_address(),
                },
            );
        } else {
            for replica in &config.replicas {
                members.insert(
                    replica.node_id,
                    Node {
                        raft_address: replica.raft_address.clone(),
                        http_address: replica.address.clone(),
                    },
                );
            }
        }
        bootstrap_cluster(&raft, members)
            .await
            .map_err(|e| anyhow::anyhow!("bootstrapping cluster: {e}"))?;
        info!("cluster membership bootstrapped");
    }

    let actions = Arc::new(RaftActions::new(raft.clone(), config.node_id));
    let clock: Arc<dyn scheduler0_commons::Clock> = Arc::new(SystemClock);
    let cancel = CancellationToken::new();

    // Repositories.
    let shared = SharedRepo::new(store.clone());
    let project_repo = Arc::new(ProjectRepo::new(
        store.clone(),
        actions.clone(),
        clock.clone(),
    ));
    let job_repo = Arc::new(JobRepo::new(store.clone(), actions.clone(), clock.clone()));
    let credential_repo = Arc::new(CredentialRepo::new(
        store.clone(),
        actions.clone(),
        clock.clone(),
    ));
    let job_queue_repo = Arc::new(JobQueueRepo::new(
        store.clone(),
        actions.clone(),
        clock.clone(),
    ));
    let executions_repo = Arc::new(ExecutionsRepo::new(
        store.clone(),
        shared.clone(),
        clock.clone(),
        config.node_id,
    ));
    let async_task_repo = Arc::new(AsyncTaskRepo::new(
        store.clone(),
        shared.clone(),
        actions.clone(),
        clock.clone(),
    ));

    // Executor and processor.
    let mode = if config.is_single_node() {
        ExecutionMode::SingleNode
    } else {
        ExecutionMode::Replicated
    };
    let executor = JobExecutor::new(
        shared.clone(),
        ExecutorConfig {
            callback_timeout: Duration::from_secs(config.execution_timeout_seconds),
            max_attempts: config.execution_retry_max,
            queue_depth: config.job_queue_depth,
            workers: config.executor_workers,
        },
        mode,
        config.node_id,
        clock.clone(),
        cancel.clone(),
    );
    executor.spawn_workers();

    let async_service = AsyncTaskService::new(
        async_task_repo.clone(),
        fsm.clone(),
        config.async_task_concurrency,
    );

    let allocator = JobQueueAllocator::new(job_repo.clone(), job_queue_repo.clone());
    let coordinator = NodeCoordinator::new(
        NodeCoordinatorConfig {
            node_id: config.node_id,
            replicas: config.replicas.clone(),
            fan_in: config.fan_in,
            fetch_interval: Duration::from_secs(config.fetch_interval_seconds),
            fan_in_timeout: Duration::from_secs(config.fan_in_timeout_seconds),
            drain_timeout: Duration::from_secs(config.shutdown_drain_seconds),
        },
        actions.clone(),
        allocator,
        async_service.clone(),
        executions_repo.clone(),
        async_task_repo.clone(),
        PeerClient::new(config.auth_username.clone(), config.auth_password.clone()),
        clock.clone(),
        cancel.clone(),
    );

    register_handlers(&async_service, job_repo.clone(), &coordinator);

    let processor = JobProcessor::new(
        job_repo.clone(),
        executions_repo.clone(),
        job_queue_repo.clone(),
        fsm.clone(),
        executor.handle(),
        mode,
        clock,
        config.node_id,
        cancel.clone(),
    );
    tokio::spawn(processor.run());
    tokio::spawn(coordinator.clone().run());
    info!("scheduling components started");

    let state = web::Data::new(AppState {
        project_repo,
        job_repo,
        credential_repo,
        executions_repo,
        async_task_repo,
        job_queue_repo,
        async_service,
        coordinator: coordinator.clone(),
        raft,
        peer_auth: (config.auth_username.clone(), config.auth_password.clone()),
    });

    Ok(ApplicationComponents { state, coordinator })
}

/// Register every async-task service handler. Unknown service names fail
/// validation at the API edge, so this is the complete registry.
fn register_handlers(
    service: &Arc<AsyncTaskService>,
    job_repo: Arc<JobRepo>,
    coordinator: &Arc<NodeCoordinator>,
) {
    // Weak reference: the coordinator owns the service, not the other way
    // around.
    let coordinator = Arc::downgrade(coordinator);
    service.register_handler(
        SERVICE_BATCH_INSERT_JOBS,
        Arc::new(move |input: String| -> scheduler0_core::HandlerFuture {
            let job_repo = job_repo.clone();
            let coordinator = coordinator.clone();
            Box::pin(async move {
                let payloads: Vec<JobDraftPayload> = serde_json::from_str(&input)
                    .map_err(|e| SchedulerError::validation(e.to_string()))?;
                let drafts: Vec<JobDraft> = payloads.into_iter().map(Into::into).collect();
                let ids = job_repo.batch_insert(drafts).await?;

                if let Some(coordinator) = coordinator.upgrade() {
                    if let Err(e) = coordinator.trigger_allocation().await {
                        log::warn!("allocation after batch insert failed: {e}");
                    }
                }

                serde_json::to_string(&ids)
                    .map_err(|e| SchedulerError::internal(e.to_string()))
            })
        }),
    );
}

/// Run the HTTP server until termination, then drain the background loops.
pub async fn run(config: &Scheduler0Config, components: ApplicationComponents) -> Result<()> {
    let state = components.state.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::request_logger())
            .wrap(middleware::build_cors())
            .configure(routes::configure)
    })
    .bind(("0.0.0.0", config.port))
    .with_context(|| format!("binding client port {}", config.port))?
    .bind(&config.raft_address)
    .with_context(|| format!("binding raft address {}", config.raft_address))?;

    info!(
        "scheduler0 listening on port {} (raft at {})",
        config.port, config.raft_address
    );
    server.run().await?;

    components.coordinator.shutdown().await;
    info!("scheduler0 stopped");
    Ok(())
}
