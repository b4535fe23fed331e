//! Domain models.
//!
//! These structs are stored in SQLite, carried inside Raft log entries, and
//! serialized over the peer HTTP API, so every one of them derives serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::NodeId;

/// A project groups jobs. Names are unique across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: u64,
    pub name: String,
    pub description: String,
    pub date_created: DateTime<Utc>,
}

/// A cron job: a callback URL fired on the instants implied by `spec`
/// interpreted under `timezone`.
///
/// `spec`, `timezone`, and `project_id` are immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: u64,
    pub project_id: u64,
    pub spec: String,
    pub timezone: String,
    pub callback_url: String,
    pub data: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub date_created: DateTime<Utc>,
}

/// API credential pair. Secrets never leave the auth path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: u64,
    pub api_key: String,
    pub api_secret: String,
    pub archived: bool,
    pub date_created: DateTime<Utc>,
}

/// One row per allocation epoch. The latest row defines the current version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobQueueVersion {
    pub version: u64,
    pub number_of_active_nodes: u64,
    pub date_created: DateTime<Utc>,
}

/// One row per (node, version): the contiguous job-id range the node owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobQueueLog {
    pub id: u64,
    pub node_id: NodeId,
    pub lower_bound_job_id: u64,
    pub upper_bound_job_id: u64,
    pub version: u64,
    pub date_created: DateTime<Utc>,
}

/// A `[lower, upper]` job-id range assigned to a node, before it is persisted
/// as a [`JobQueueLog`]. `[0, 0]` marks an empty assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRange {
    pub node_id: NodeId,
    pub lower_bound_job_id: u64,
    pub upper_bound_job_id: u64,
}

impl NodeRange {
    pub fn is_empty(&self) -> bool {
        self.lower_bound_job_id == 0 && self.upper_bound_job_id == 0
    }
}

/// Lifecycle of a single fire attempt.
///
/// `Missed` is a recorded skip (counted as a success flavor: the fire is never
/// back-filled) and `QueueOverflow` records a drop under backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    #[default]
    Queued,
    Scheduled,
    Success,
    Failed,
    Missed,
    QueueOverflow,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Queued => "queued",
            ExecutionState::Scheduled => "scheduled",
            ExecutionState::Success => "success",
            ExecutionState::Failed => "failed",
            ExecutionState::Missed => "missed",
            ExecutionState::QueueOverflow => "queue_overflow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ExecutionState::Queued),
            "scheduled" => Some(ExecutionState::Scheduled),
            "success" => Some(ExecutionState::Success),
            "failed" => Some(ExecutionState::Failed),
            "missed" => Some(ExecutionState::Missed),
            "queue_overflow" => Some(ExecutionState::QueueOverflow),
            _ => None,
        }
    }

    /// Terminal states settle invariant "at most one outcome per fire".
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Success
                | ExecutionState::Failed
                | ExecutionState::Missed
                | ExecutionState::QueueOverflow
        )
    }
}

/// A single execution record. Lives in the uncommitted bucket while local to
/// one node and in the committed bucket once applied through Raft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionLog {
    pub id: u64,
    pub unique_id: String,
    pub state: ExecutionState,
    pub node_id: NodeId,
    pub last_execution_datetime: DateTime<Utc>,
    pub next_execution_datetime: DateTime<Utc>,
    pub job_id: u64,
    pub execution_version: u64,
    pub job_queue_version: u64,
    pub date_created: DateTime<Utc>,
}

impl JobExecutionLog {
    /// Deterministic identity of one fire attempt. Peers that produce the same
    /// (job, instant, node, version) tuple produce the same id, which is what
    /// makes the committed-bucket inserts idempotent.
    pub fn compute_unique_id(
        job_id: u64,
        next_execution_datetime: DateTime<Utc>,
        node_id: NodeId,
        execution_version: u64,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!(
                "{}-{}-{}-{}",
                job_id,
                next_execution_datetime.to_rfc3339(),
                node_id,
                execution_version
            )
            .as_bytes(),
        );
        hex_encode(&hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// State of a durable client write intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AsyncTaskState {
    #[default]
    NotStarted,
    InProgress,
    Success,
    Failed,
}

impl AsyncTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncTaskState::NotStarted => "not_started",
            AsyncTaskState::InProgress => "in_progress",
            AsyncTaskState::Success => "success",
            AsyncTaskState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(AsyncTaskState::NotStarted),
            "in_progress" => Some(AsyncTaskState::InProgress),
            "success" => Some(AsyncTaskState::Success),
            "failed" => Some(AsyncTaskState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AsyncTaskState::Success | AsyncTaskState::Failed)
    }
}

/// A replicated one-shot work item. `(request_id, service)` is unique, which
/// is what deduplicates client retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AsyncTask {
    pub id: u64,
    pub request_id: String,
    pub service: String,
    pub input: String,
    pub output: String,
    pub state: AsyncTaskState,
    pub date_created: DateTime<Utc>,
}

/// Payload a peer returns during fan-in: the execution logs and async tasks it
/// produced locally while it was not the leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LocalData {
    pub execution_logs: Vec<JobExecutionLog>,
    pub async_tasks: Vec<AsyncTask>,
}

impl LocalData {
    pub fn is_empty(&self) -> bool {
        self.execution_logs.is_empty() && self.async_tasks.is_empty()
    }
}

/// Fan-in progress for a single peer, keyed by its HTTP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerFanInState {
    #[default]
    NotStarted,
    GetRequestId,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PeerFanIn {
    pub peer_http_address: String,
    pub state: PeerFanInState,
    pub request_id: String,
    pub async_task_id: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// A peer node as configured in `SCHEDULER0_REPLICAS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
    #[serde(rename = "raftAddress")]
    pub raft_address: String,
    /// Client-facing HTTP address.
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unique_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let a = JobExecutionLog::compute_unique_id(7, at, 2, 1);
        let b = JobExecutionLog::compute_unique_id(7, at, 2, 1);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn unique_id_varies_with_inputs() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let base = JobExecutionLog::compute_unique_id(7, at, 2, 1);
        assert_ne!(base, JobExecutionLog::compute_unique_id(8, at, 2, 1));
        assert_ne!(base, JobExecutionLog::compute_unique_id(7, at, 3, 1));
        assert_ne!(base, JobExecutionLog::compute_unique_id(7, at, 2, 2));
    }

    #[test]
    fn execution_state_round_trips() {
        for state in [
            ExecutionState::Queued,
            ExecutionState::Scheduled,
            ExecutionState::Success,
            ExecutionState::Failed,
            ExecutionState::Missed,
            ExecutionState::QueueOverflow,
        ] {
            assert_eq!(ExecutionState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ExecutionState::parse("nope"), None);
    }

    #[test]
    fn replicas_parse_from_env_json() {
        let json = r#"[{"nodeId":1,"raftAddress":"127.0.0.1:7071","address":"http://127.0.0.1:9091"}]"#;
        let replicas: Vec<Replica> = serde_json::from_str(json).unwrap();
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].node_id, 1);
        assert_eq!(replicas[0].address, "http://127.0.0.1:9091");
    }
}
