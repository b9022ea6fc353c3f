//! Failure taxonomy for downstream calls.
//!
//! Every collaborator (source, model, venue) reports failure as a
//! [`CallError`]. Its [`ErrorKind`] decides how the failure is handled:
//! whether it is retried, with which backoff policy, and whether it
//! triggers endpoint rotation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network error, 5xx, or timeout
    Transient,

    /// Quota exhaustion (HTTP 429 and friends)
    RateLimit,

    /// Venue rejected the unit of work but marked it transient
    ExecutionTransient,

    /// Venue rejected the unit of work for good
    ExecutionRejected,

    /// Producer computation failed but may succeed on retry
    InferenceTransient,

    /// Producer computation failed for good
    InferenceFailure,

    /// Malformed input, never retried
    Validation,

    /// Call short-circuited by an open breaker
    CircuitOpen,
}

impl ErrorKind {
    /// Kinds that have a retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::RateLimit
                | ErrorKind::ExecutionTransient
                | ErrorKind::InferenceTransient
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ExecutionTransient => "execution_transient",
            ErrorKind::ExecutionRejected => "execution_rejected",
            ErrorKind::InferenceTransient => "inference_transient",
            ErrorKind::InferenceFailure => "inference_failure",
            ErrorKind::Validation => "validation",
            ErrorKind::CircuitOpen => "circuit_open",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "transient" | "network" => Ok(ErrorKind::Transient),
            "rate_limit" => Ok(ErrorKind::RateLimit),
            "execution_transient" => Ok(ErrorKind::ExecutionTransient),
            "execution_rejected" => Ok(ErrorKind::ExecutionRejected),
            "inference_transient" => Ok(ErrorKind::InferenceTransient),
            "inference_failure" => Ok(ErrorKind::InferenceFailure),
            "validation" => Ok(ErrorKind::Validation),
            "circuit_open" => Ok(ErrorKind::CircuitOpen),
            other => Err(format!("unknown error kind: '{}'", other)),
        }
    }
}

/// A classified failure from a single downstream call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("transient failure from {endpoint}: {message}")]
    Transient { endpoint: String, message: String },

    #[error("{endpoint} timed out after {after:?}")]
    Timeout { endpoint: String, after: Duration },

    #[error("rate limited by {endpoint}, retry after {retry_after:?}")]
    RateLimited {
        endpoint: String,
        retry_after: Option<Duration>,
    },

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{endpoint} rejected execution: {message}")]
    Execution {
        endpoint: String,
        message: String,
        transient: bool,
    },

    #[error("inference failed in {endpoint}: {message}")]
    Inference {
        endpoint: String,
        message: String,
        transient: bool,
    },

    #[error("circuit open for {endpoint}, next probe in {retry_in:?}")]
    CircuitOpen { endpoint: String, retry_in: Duration },
}

impl CallError {
    pub fn transient(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        CallError::Transient {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn rate_limited(endpoint: impl Into<String>, retry_after: Option<Duration>) -> Self {
        CallError::RateLimited {
            endpoint: endpoint.into(),
            retry_after,
        }
    }

    pub fn inference(endpoint: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        CallError::Inference {
            endpoint: endpoint.into(),
            message: message.into(),
            transient,
        }
    }

    pub fn execution(endpoint: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        CallError::Execution {
            endpoint: endpoint.into(),
            message: message.into(),
            transient,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CallError::Transient { .. } | CallError::Timeout { .. } => ErrorKind::Transient,
            CallError::RateLimited { .. } => ErrorKind::RateLimit,
            CallError::Validation(_) => ErrorKind::Validation,
            CallError::Execution { transient: true, .. } => ErrorKind::ExecutionTransient,
            CallError::Execution { transient: false, .. } => ErrorKind::ExecutionRejected,
            CallError::Inference { transient: true, .. } => ErrorKind::InferenceTransient,
            CallError::Inference { transient: false, .. } => ErrorKind::InferenceFailure,
            CallError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
        }
    }

    /// The endpoint that produced this failure, when known.
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            CallError::Transient { endpoint, .. }
            | CallError::Timeout { endpoint, .. }
            | CallError::RateLimited { endpoint, .. }
            | CallError::Execution { endpoint, .. }
            | CallError::Inference { endpoint, .. }
            | CallError::CircuitOpen { endpoint, .. } => Some(endpoint),
            CallError::Validation(_) => None,
        }
    }

    /// Provider-supplied wait hint carried by rate-limit failures.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether the endpoint should be rotated out of a pool after this failure.
    pub fn triggers_rotation(&self) -> bool {
        matches!(self.kind(), ErrorKind::RateLimit | ErrorKind::CircuitOpen)
    }
}
