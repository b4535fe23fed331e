//! Shared domain types for Scheduler0.
//!
//! Everything here is plain data: models that cross the Raft log, the
//! cluster-wide error taxonomy, table/environment constants, and the clock
//! capability that keeps the scheduling components testable.

pub mod clock;
pub mod constants;
pub mod errors;
pub mod models;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::SchedulerError;
pub use models::{
    AsyncTask, AsyncTaskState, Credential, ExecutionState, Job, JobExecutionLog, JobQueueLog,
    JobQueueVersion, LocalData, NodeRange, PeerFanIn, PeerFanInState, Project, Replica,
};

/// Identifies a node in the cluster. Matches the Raft node id space.
pub type NodeId = u64;
