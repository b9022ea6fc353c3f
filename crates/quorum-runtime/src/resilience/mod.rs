//! Resilience patterns for quorum-runtime.
//!
//! This module provides:
//! - Circuit breaker per endpoint to prevent cascade failures
//! - Retry with per-error-kind exponential backoff
//! - Cost budgets per work unit and per session
//! - Endpoint rotation over rate-limited pools

mod budget;
mod circuit_breaker;
mod retry;
mod rotation;

pub use budget::{CostBudget, CostBudgetTracker, Reservation, SpendSummary};
pub use circuit_breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState, Permit};
pub use retry::RetryExecutor;
pub use rotation::{EndpointRotator, RotationRegistry, MAX_EXCLUSION};
