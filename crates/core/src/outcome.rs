//! Handler results.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by a job handler.
///
/// Anything converted from `anyhow::Error` (e.g. via `?`) counts as an
/// unexpected failure and is retried. Use [`HandlerError::fatal`] for input
/// that can never succeed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Shorthand for a non-retryable validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Fatal(format!("validation failed: {}", msg.into()))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        // A payload that does not decode will not decode next time either.
        Self::validation(err.to_string())
    }
}

/// Result of one execution attempt, as reported to the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    RetryableFailure(String),
    FatalFailure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::RetryableFailure(r) | Outcome::FatalFailure(r) => Some(r),
        }
    }
}

impl From<Result<(), HandlerError>> for Outcome {
    fn from(result: Result<(), HandlerError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(HandlerError::Retryable(reason)) => Outcome::RetryableFailure(reason),
            Err(HandlerError::Fatal(reason)) => Outcome::FatalFailure(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(payload: serde_json::Value) -> Result<u32, HandlerError> {
        Ok(serde_json::from_value(payload)?)
    }

    fn unexpected() -> Result<(), HandlerError> {
        let io: anyhow::Result<()> = Err(anyhow::anyhow!("connection refused"));
        io.map_err(|e| e.context("calling billing"))?;
        Ok(())
    }

    #[test]
    fn unexpected_errors_are_retryable() {
        let outcome = Outcome::from(unexpected());
        assert_eq!(
            outcome,
            Outcome::RetryableFailure("calling billing: connection refused".to_string())
        );
    }

    #[test]
    fn undecodable_payload_is_fatal() {
        let err = decode(serde_json::json!("nope")).unwrap_err();
        assert!(!err.is_retryable());
        assert!(matches!(Outcome::from(Err(err)), Outcome::FatalFailure(_)));
    }

    #[test]
    fn success_has_no_reason() {
        assert!(Outcome::from(Ok(())).is_success());
        assert_eq!(Outcome::Success.reason(), None);
        assert_eq!(Outcome::FatalFailure("x".into()).reason(), Some("x"));
    }
}
