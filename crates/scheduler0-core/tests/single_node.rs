//! Single-node integration tests: a real raft instance over an in-memory
//! store, exercised through the repositories and the raft actions layer.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use scheduler0_commons::models::{ExecutionState, JobExecutionLog, LocalData};
use scheduler0_commons::{ManualClock, SchedulerError};
use scheduler0_core::repos::{
    AsyncTaskRepo, CredentialRepo, ExecutionsRepo, JobDraft, JobQueueRepo, JobRepo, JobUpdate,
    ProjectRepo,
};
use scheduler0_core::JobQueueAllocator;
use scheduler0_raft::{
    bootstrap_cluster, start_raft, HttpRaftNetwork, Node, RaftActions, RaftConfigOptions,
    SchedulerFsm, SchedulerRaftStorage,
};
use scheduler0_store::{SharedRepo, SqliteStore};

const NODE_ID: u64 = 1;

struct TestNode {
    store: Arc<SqliteStore>,
    actions: Arc<RaftActions>,
    clock: Arc<ManualClock>,
}

impl TestNode {
    fn clock_dyn(&self) -> Arc<dyn scheduler0_commons::Clock> {
        self.clock.clone()
    }

    fn projects(&self) -> ProjectRepo {
        ProjectRepo::new(self.store.clone(), self.actions.clone(), self.clock_dyn())
    }

    fn jobs(&self) -> JobRepo {
        JobRepo::new(self.store.clone(), self.actions.clone(), self.clock_dyn())
    }

    fn credentials(&self) -> CredentialRepo {
        CredentialRepo::new(self.store.clone(), self.actions.clone(), self.clock_dyn())
    }

    fn queue(&self) -> JobQueueRepo {
        JobQueueRepo::new(self.store.clone(), self.actions.clone(), self.clock_dyn())
    }

    fn shared(&self) -> SharedRepo {
        SharedRepo::new(self.store.clone())
    }

    fn executions(&self) -> ExecutionsRepo {
        ExecutionsRepo::new(self.store.clone(), self.shared(), self.clock_dyn(), NODE_ID)
    }

    fn async_tasks(&self) -> AsyncTaskRepo {
        AsyncTaskRepo::new(
            self.store.clone(),
            self.shared(),
            self.actions.clone(),
            self.clock_dyn(),
        )
    }
}

async fn boot() -> TestNode {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let fsm = Arc::new(SchedulerFsm::new(store.clone()));
    let storage = Arc::new(SchedulerRaftStorage::new(fsm));
    let network = HttpRaftNetwork::new();

    let raft = start_raft(NODE_ID, RaftConfigOptions::default(), network, storage)
        .await
        .unwrap();

    let mut members = BTreeMap::new();
    members.insert(
        NODE_ID,
        Node {
            raft_address: "127.0.0.1:7071".into(),
            http_address: "http://127.0.0.1:9091".into(),
        },
    );
    bootstrap_cluster(&raft, members).await.unwrap();

    // Single node elects itself; wait for the metrics to confirm.
    for _ in 0..200 {
        if raft.metrics().borrow().current_leader == Some(NODE_ID) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let actions = Arc::new(RaftActions::new(raft, NODE_ID));
    assert!(actions.is_leader(), "single node failed to elect itself");

    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    TestNode {
        store,
        actions,
        clock,
    }
}

#[tokio::test]
async fn project_create_read_back_and_duplicate_rejection() {
    let node = boot().await;
    let projects = node.projects();

    let created = projects.create_one("a", "first project").await.unwrap();
    assert_eq!(created.id, 1);
    assert_eq!(created.name, "a");

    // Insert-then-get returns equal fields.
    let fetched = projects.get_one_by_id(created.id).unwrap().unwrap();
    assert_eq!(fetched, created);

    // Duplicate name is a validation error and leaves count at 1.
    let duplicate = projects.create_one("a", "second").await;
    assert!(matches!(duplicate, Err(SchedulerError::Validation(_))));
    assert_eq!(projects.count().unwrap(), 1);
}

#[tokio::test]
async fn project_delete_rejected_while_jobs_exist() {
    let node = boot().await;
    let projects = node.projects();
    let jobs = node.jobs();

    let project = projects.create_one("p", "desc").await.unwrap();
    jobs.create_one(JobDraft {
        project_id: project.id,
        spec: "0 * * * * *".into(),
        timezone: "UTC".into(),
        callback_url: "http://127.0.0.1:9/cb".into(),
        data: "{}".into(),
        ..Default::default()
    })
    .await
    .unwrap();

    let denied = projects.delete_one_by_id(project.id).await;
    assert!(matches!(denied, Err(SchedulerError::Validation(_))));
}

#[tokio::test]
async fn job_updates_cannot_touch_spec_timezone_or_project() {
    let node = boot().await;
    let projects = node.projects();
    let jobs = node.jobs();

    let project = projects.create_one("p", "desc").await.unwrap();
    let job = jobs
        .create_one(JobDraft {
            project_id: project.id,
            spec: "0 */5 * * * *".into(),
            timezone: "UTC".into(),
            callback_url: "http://127.0.0.1:9/cb".into(),
            data: "{}".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let rejected = jobs
        .update_one_by_id(
            job.id,
            JobUpdate {
                spec: Some("0 * * * * *".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(rejected, Err(SchedulerError::Validation(_))));

    // The stored job is untouched.
    let stored = jobs.get_one_by_id(job.id).unwrap().unwrap();
    assert_eq!(stored.spec, "0 */5 * * * *");

    // Mutable fields update fine.
    let updated = jobs
        .update_one_by_id(
            job.id,
            JobUpdate {
                data: Some("{\"k\":1}".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.data, "{\"k\":1}");
    assert_eq!(updated.spec, job.spec);
}

#[tokio::test]
async fn batch_insert_returns_contiguous_ids() {
    let node = boot().await;
    let projects = node.projects();
    let jobs = node.jobs();

    let project = projects.create_one("p", "desc").await.unwrap();
    let drafts: Vec<JobDraft> = (0..5)
        .map(|i| JobDraft {
            project_id: project.id,
            spec: "0 * * * * *".into(),
            timezone: "UTC".into(),
            callback_url: format!("http://127.0.0.1:9/cb/{i}"),
            data: "{}".into(),
            ..Default::default()
        })
        .collect();

    let ids = jobs.batch_insert(drafts).await.unwrap();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(jobs.get_max_id().unwrap(), 5);
}

#[tokio::test]
async fn allocation_partitions_the_job_id_space() {
    let node = boot().await;
    let projects = node.projects();
    let jobs = node.jobs();
    let queue = Arc::new(node.queue());

    let project = projects.create_one("p", "desc").await.unwrap();
    let drafts: Vec<JobDraft> = (0..10)
        .map(|_| JobDraft {
            project_id: project.id,
            spec: "0 * * * * *".into(),
            timezone: "UTC".into(),
            callback_url: "http://127.0.0.1:9/cb".into(),
            data: "{}".into(),
            ..Default::default()
        })
        .collect();
    jobs.batch_insert(drafts).await.unwrap();

    let allocator = JobQueueAllocator::new(Arc::new(node.jobs()), queue.clone());
    let version = allocator.allocate(&[NODE_ID]).await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(queue.get_last_version().unwrap(), 1);

    let range = queue
        .get_last_job_queue_log_for_node(NODE_ID, version)
        .unwrap()
        .unwrap();
    assert_eq!(range.lower_bound_job_id, 1);
    assert_eq!(range.upper_bound_job_id, 10);

    // A second allocation bumps the version monotonically.
    let next = allocator.allocate(&[NODE_ID]).await.unwrap();
    assert_eq!(next, 2);
}

#[tokio::test]
async fn async_task_creation_is_idempotent_across_calls() {
    let node = boot().await;
    let tasks = node.async_tasks();

    let first = tasks.create("{}", "r1", "batch_insert_jobs").await.unwrap();
    let second = tasks.create("{}", "r1", "batch_insert_jobs").await.unwrap();
    assert_eq!(first, second);

    let rows = tasks.list_by_request_id("r1").unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn fan_in_merge_commits_without_deleting_the_source_bucket() {
    let node = boot().await;
    let shared = node.shared();
    let executions = node.executions();

    // 24 uncommitted logs as a partitioned peer would have produced.
    let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let logs: Vec<JobExecutionLog> = (1..=24)
        .map(|job_id| JobExecutionLog {
            id: 0,
            unique_id: JobExecutionLog::compute_unique_id(job_id, at, NODE_ID, 1),
            state: ExecutionState::Success,
            node_id: NODE_ID,
            last_execution_datetime: at,
            next_execution_datetime: at,
            job_id,
            execution_version: 1,
            job_queue_version: 1,
            date_created: at,
        })
        .collect();
    shared.insert_execution_logs(false, &logs).unwrap();

    let data = LocalData {
        execution_logs: logs,
        async_tasks: Vec::new(),
    };
    node.actions.commit_local_data(data.clone()).await.unwrap();

    assert_eq!(executions.count_execution_logs(true).unwrap(), 24);
    // The peer's uncommitted bucket is merged, not drained.
    assert_eq!(executions.count_execution_logs(false).unwrap(), 24);

    // Re-merging is a no-op thanks to unique_id idempotency.
    node.actions.commit_local_data(data).await.unwrap();
    assert_eq!(executions.count_execution_logs(true).unwrap(), 24);
}

#[tokio::test]
async fn credentials_round_trip_and_guard_last_active() {
    let node = boot().await;
    let credentials = node.credentials();

    let created = credentials.create_one().await.unwrap();
    assert_eq!(created.api_key.len(), 64);
    assert_eq!(created.api_secret.len(), 64);

    let found = credentials
        .find_by_key_and_secret(&created.api_key, &created.api_secret)
        .unwrap();
    assert_eq!(found, Some(created.clone()));

    // The only active credential cannot be deleted.
    let denied = credentials.delete_one_by_id(created.id).await;
    assert!(matches!(denied, Err(SchedulerError::Validation(_))));

    // With a second credential in place the first can go.
    credentials.create_one().await.unwrap();
    assert_eq!(credentials.delete_one_by_id(created.id).await.unwrap(), 1);
}
