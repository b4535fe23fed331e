//! Table names and environment variable keys.

// Domain tables.
pub const PROJECTS_TABLE: &str = "projects";
pub const JOBS_TABLE: &str = "jobs";
pub const CREDENTIALS_TABLE: &str = "credentials";
pub const JOB_QUEUE_VERSIONS_TABLE: &str = "job_queue_versions";
pub const JOB_QUEUES_TABLE: &str = "job_queues";

// Execution logs and async tasks live in two buckets: rows produced locally
// on one node (uncommitted) and rows applied through the Raft log (committed).
pub const EXECUTIONS_COMMITTED_TABLE: &str = "job_executions_committed";
pub const EXECUTIONS_UNCOMMITTED_TABLE: &str = "job_executions_uncommitted";
pub const ASYNC_TASKS_COMMITTED_TABLE: &str = "async_tasks_committed";
pub const ASYNC_TASKS_UNCOMMITTED_TABLE: &str = "async_tasks_uncommitted";

// Environment variable keys.
pub const ENV_NODE_ID: &str = "SCHEDULER0_NODE_ID";
pub const ENV_PORT: &str = "SCHEDULER0_PORT";
pub const ENV_RAFT_ADDRESS: &str = "SCHEDULER0_RAFT_ADDRESS";
pub const ENV_REPLICAS: &str = "SCHEDULER0_REPLICAS";
pub const ENV_BOOTSTRAP: &str = "SCHEDULER0_BOOTSTRAP";
pub const ENV_FAN_IN: &str = "SCHEDULER0_EXECUTION_LOG_FETCH_FAN_IN";
pub const ENV_FETCH_INTERVAL: &str = "SCHEDULER0_EXECUTION_LOG_FETCH_INTERVAL_SECONDS";
pub const ENV_SQLITE_FILE_PATH: &str = "SCHEDULER0_SQLITE_FILE_PATH";
pub const ENV_LOG_LEVEL: &str = "SCHEDULER0_LOG_LEVEL";
pub const ENV_LOG_FILE_PATH: &str = "SCHEDULER0_LOG_FILE_PATH";
pub const ENV_EXECUTION_TIMEOUT: &str = "SCHEDULER0_JOB_EXECUTION_TIMEOUT_SECONDS";
pub const ENV_EXECUTION_RETRY_MAX: &str = "SCHEDULER0_JOB_EXECUTION_RETRY_MAX";
pub const ENV_JOB_QUEUE_DEPTH: &str = "SCHEDULER0_JOB_QUEUE_DEPTH";
pub const ENV_EXECUTOR_WORKERS: &str = "SCHEDULER0_JOB_EXECUTOR_WORKERS";
pub const ENV_ASYNC_TASK_CONCURRENCY: &str = "SCHEDULER0_ASYNC_TASK_CONCURRENCY";
pub const ENV_FAN_IN_TIMEOUT: &str = "SCHEDULER0_FAN_IN_TIMEOUT_SECONDS";
pub const ENV_SHUTDOWN_DRAIN: &str = "SCHEDULER0_SHUTDOWN_DRAIN_SECONDS";
pub const ENV_AUTH_USERNAME: &str = "SCHEDULER0_AUTH_USERNAME";
pub const ENV_AUTH_PASSWORD: &str = "SCHEDULER0_AUTH_PASSWORD";

/// Async-task service name for batch job creation.
pub const SERVICE_BATCH_INSERT_JOBS: &str = "batch_insert_jobs";
/// Async-task service name for the peer local-data collection during fan-in.
pub const SERVICE_LOCAL_DATA: &str = "local_data";
