//! # quorum-runtime
//!
//! Async machinery for calling unreliable, costly endpoints.
//!
//! - [`CircuitBreaker`] and [`BreakerRegistry`]: per-endpoint short-circuiting
//! - [`RetryExecutor`]: bounded backoff chosen by failure kind
//! - [`EndpointRotator`] and [`RotatingProducer`]: round-robin pools that
//!   skip rate-limited endpoints
//! - [`CostBudgetTracker`]: per-unit and per-session spend ceilings
//! - [`TierRouter`]: cheapest-first routing with fallback
//! - [`EnsembleAggregator`]: concurrent fan-out with a consensus barrier
//! - [`EventBus`]: structured events for completed work and transitions
//!
//! Everything that calls out does so through the [`Producer`] trait, so
//! routing and aggregation never depend on a concrete client.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quorum_runtime::{EnsembleAggregator, GuardedProducer, BreakerRegistry, RetryExecutor};
//!
//! let breakers = BreakerRegistry::new(config.breakers.clone());
//! let retry = RetryExecutor::new(config.retry.clone());
//! let producers = vec![
//!     GuardedProducer::from_registry(lstm, &breakers, retry.clone()).into_dyn(),
//!     GuardedProducer::from_registry(xgboost, &breakers, retry.clone()).into_dyn(),
//! ];
//!
//! let aggregator = EnsembleAggregator::from_config(&config);
//! let result = aggregator.aggregate(&unit, &producers).await?;
//! println!("consensus {:.3} ({} agree)", result.consensus_value, result.agreement_ratio);
//! ```

pub mod aggregator;
pub mod cache;
pub mod error;
pub mod events;
pub mod producers;
pub mod providers;
pub mod resilience;
pub mod router;

pub use aggregator::EnsembleAggregator;
pub use cache::{EnsembleCache, EnsembleKey};
pub use error::{QuorumError, TierFailure};
pub use events::{Event, EventBus, EventDeduplicator, EventPayload, Subscription, DEFAULT_EVENT_CAPACITY};
pub use producers::{
    DynProducer, GuardedProducer, ModelClient, ModelProducer, Outcome, Producer, RotatingProducer,
    SourceClient, SourceProducer, VenueClient, VenueProducer,
};
pub use resilience::{
    BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState, CostBudget, CostBudgetTracker,
    EndpointRotator, Permit, Reservation, RetryExecutor, RotationRegistry, SpendSummary,
};
pub use router::{RoutedResult, Tier, TierRouter};
