//! Cluster-wide error taxonomy.
//!
//! Domain code surfaces `SchedulerError`; the HTTP boundary translates it to a
//! status code and `{error, code}` body. Validation always happens before a
//! command reaches the Raft log; the apply path never returns these.

use thiserror::Error;

/// Result type for domain operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// Rejected by a domain invariant (missing field, cron parse failure,
    /// duplicate name, illegal update).
    #[error("{0}")]
    Validation(String),

    /// Write attempted on a follower. Carries the leader's client address
    /// when known so the HTTP layer can answer with a redirect.
    #[error("node is not the raft leader")]
    NotLeader { leader_address: Option<String> },

    #[error("{0}")]
    NotFound(String),

    /// Idempotency violation: same key, different payload.
    #[error("{0}")]
    Conflict(String),

    /// Quorum lost, store full, or the node is shutting down.
    #[error("{0}")]
    Unavailable(String),

    /// Apply failure, storage corruption, or any other defect.
    #[error("{0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        SchedulerError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        SchedulerError::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        SchedulerError::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        SchedulerError::Internal(msg.into())
    }

    /// HTTP status code for this error per the API contract.
    pub fn status_code(&self) -> u16 {
        match self {
            SchedulerError::Validation(_) => 400,
            SchedulerError::NotLeader { .. } => 301,
            SchedulerError::NotFound(_) => 404,
            SchedulerError::Conflict(_) => 409,
            SchedulerError::Unavailable(_) => 503,
            SchedulerError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(SchedulerError::validation("x").status_code(), 400);
        assert_eq!(
            SchedulerError::NotLeader {
                leader_address: None
            }
            .status_code(),
            301
        );
        assert_eq!(SchedulerError::not_found("x").status_code(), 404);
        assert_eq!(SchedulerError::conflict("x").status_code(), 409);
        assert_eq!(SchedulerError::unavailable("x").status_code(), 503);
        assert_eq!(SchedulerError::internal("x").status_code(), 500);
    }
}
