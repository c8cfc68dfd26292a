//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobState;

/// Result type used across the queue crates.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Handler failures are not represented here; they travel as
/// [`crate::HandlerError`] and are turned into state transitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Enqueue input was rejected (unknown type, bad options).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The payload could not be serialized.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The caller no longer holds the claim on this job.
    #[error("claim lost for job {0}")]
    ClaimLost(JobId),

    /// No job with this id exists.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// A state change not permitted by the job state machine.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobState, to: JobState },

    /// Transient connectivity failure; safe to retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Non-transient store failure (constraint violation, corrupt row).
    #[error("storage error: {0}")]
    Storage(String),

    /// Missing or malformed configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_unavailable_is_transient() {
        assert!(QueueError::unavailable("connection reset").is_transient());
        assert!(!QueueError::storage("constraint").is_transient());
        assert!(!QueueError::ClaimLost(JobId::new()).is_transient());
        assert!(!QueueError::validation("bad").is_transient());
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = QueueError::InvalidTransition {
            from: JobState::Completed,
            to: JobState::Active,
        };
        assert_eq!(err.to_string(), "invalid transition from completed to active");
    }
}
