//! # quorum-core
//!
//! Data model, failure taxonomy, consensus, and configuration for Quorum.
//!
//! This crate never performs I/O beyond reading config files. The async
//! machinery that calls external endpoints (breakers, retry, rotation,
//! tier routing, ensemble fan-out) lives in `quorum-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quorum_core::{QuorumConfig, ErrorKind};
//!
//! let config = QuorumConfig::from_file("quorum.yaml")?;
//! let policy = config.retry.policy_for(ErrorKind::RateLimit);
//! println!("rate limits wait {:?}", policy.schedule());
//! ```

pub mod config;
pub mod consensus;
pub mod error;
pub mod types;

pub use config::{
    BreakerSettings, BreakerTable, BudgetConfig, ConfigError, EnsembleConfig, ExhaustionPolicy,
    QuorumConfig, RetryPolicy, RetryTable, RotationConfig, TierConfig, MIN_PRODUCERS,
};
pub use consensus::{Consensus, ConsensusEngine, Direction};
pub use error::{CallError, ErrorKind};
pub use types::{
    Endpoint, EndpointCategory, EnsembleResult, ExecutionResult, Exclusion, ProducerResult,
    WorkUnit, DEFAULT_CALL_TIMEOUT,
};
