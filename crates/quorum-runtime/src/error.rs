//! Terminal errors surfaced to callers.

use quorum_core::{CallError, ConfigError, ErrorKind, Exclusion};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why one tier was abandoned during routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierFailure {
    pub tier: String,
    pub reason: String,

    /// Set when the tier was attempted and failed; absent when it was skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl TierFailure {
    pub fn skipped(tier: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            reason: reason.into(),
            kind: None,
        }
    }

    pub fn failed(tier: impl Into<String>, error: &CallError) -> Self {
        Self {
            tier: tier.into(),
            reason: error.to_string(),
            kind: Some(error.kind()),
        }
    }

    pub fn was_attempted(&self) -> bool {
        self.kind.is_some()
    }
}

impl fmt::Display for TierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{} [{}]: {}", self.tier, kind, self.reason),
            None => write!(f, "{} [skipped]: {}", self.tier, self.reason),
        }
    }
}

fn list_failures(failures: &[TierFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn list_exclusions(excluded: &[Exclusion]) -> String {
    excluded
        .iter()
        .map(|e| format!("{} ({})", e.producer_id, e.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// The single terminal error a Quorum caller can receive.
///
/// Low-level transport failures never escape directly; they are folded
/// into one of these variants naming the exhausted resource.
#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("Invalid work unit: {0}")]
    Validation(String),

    #[error("All tiers exhausted for {correlation_id}: {}", list_failures(.failures))]
    AllTiersExhausted {
        correlation_id: String,
        failures: Vec<TierFailure>,
    },

    #[error("Rotation pool exhausted: {0}")]
    RotationExhausted(String),

    #[error(
        "Insufficient producers: {succeeded} succeeded, {required} required; excluded {}",
        list_exclusions(.excluded)
    )]
    InsufficientProducers {
        succeeded: usize,
        required: usize,
        excluded: Vec<Exclusion>,
    },

    #[error("Budget exceeded: requested ${requested:.4}, remaining ${remaining:.4}")]
    BudgetExceeded { requested: f64, remaining: f64 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Fold a rejected work unit or call input into the terminal error.
pub(crate) fn invalid(error: CallError) -> QuorumError {
    match error {
        CallError::Validation(message) => QuorumError::Validation(message),
        other => QuorumError::Validation(other.to_string()),
    }
}
