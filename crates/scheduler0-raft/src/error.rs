//! Error types for the Raft layer.

use scheduler0_commons::SchedulerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, Error)]
pub enum RaftError {
    /// The local node is not the leader. Carries the leader's client-facing
    /// HTTP address when known.
    #[error("not leader; leader is at {leader_http_address:?}")]
    NotLeader {
        leader_http_address: Option<String>,
    },

    /// Command submitted but not applied within the deadline.
    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The raft log store rejected the append.
    #[error("raft log store is full")]
    StoreFull,

    /// Raft is shutting down or hit a fatal error.
    #[error("raft is shutting down: {0}")]
    Shutdown(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Proposal rejected for a reason other than leadership.
    #[error("proposal rejected: {0}")]
    Proposal(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RaftError {
    pub fn not_leader(leader_http_address: Option<String>) -> Self {
        RaftError::NotLeader {
            leader_http_address,
        }
    }

    /// Retrying may succeed for leadership and transport failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader { .. } | RaftError::Timeout(_) | RaftError::Network(_)
        )
    }
}

impl From<bincode::error::EncodeError> for RaftError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<scheduler0_store::StoreError> for RaftError {
    fn from(err: scheduler0_store::StoreError) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<RaftError> for SchedulerError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader {
                leader_http_address,
            } => SchedulerError::NotLeader {
                leader_address: leader_http_address,
            },
            RaftError::Timeout(_) | RaftError::StoreFull | RaftError::Shutdown(_) => {
                SchedulerError::Unavailable(err.to_string())
            }
            other => SchedulerError::Internal(other.to_string()),
        }
    }
}
