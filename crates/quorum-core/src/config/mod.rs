//! Configuration loading and validation.
//!
//! Configuration is YAML or JSON, checked against an embedded JSON Schema
//! and then against cross-field rules. Every section is optional and
//! falls back to documented defaults.

pub mod duration;
mod parser;
mod schema;

pub use parser::{
    BreakerSettings, BreakerTable, BudgetConfig, ConfigError, EnsembleConfig, ExhaustionPolicy,
    QuorumConfig, RetryPolicy, RetryTable, RotationConfig, TierConfig, MIN_PRODUCERS,
};
pub use schema::validate_config_schema;
