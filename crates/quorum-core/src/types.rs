//! Data model shared by every Quorum component.
//!
//! Everything here is plain data. Mutable runtime state (circuit state,
//! rotation registry, remaining budgets) lives in `quorum-runtime` and is
//! owned by the component that guards it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::duration;
use crate::error::{CallError, ErrorKind};

/// Default per-attempt timeout for an endpoint that does not configure one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Which family of downstream dependency an endpoint belongs to.
///
/// The category selects the circuit breaker defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    /// Intelligence/search sources
    IntelligenceSource,

    /// Forecasting models
    ForecastingModel,

    /// Trading venues
    TradingVenue,

    /// Interchangeable low-cost endpoints served from a rotation pool
    RotationPool,
}

impl EndpointCategory {
    pub const ALL: [EndpointCategory; 4] = [
        EndpointCategory::IntelligenceSource,
        EndpointCategory::ForecastingModel,
        EndpointCategory::TradingVenue,
        EndpointCategory::RotationPool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointCategory::IntelligenceSource => "intelligence_source",
            EndpointCategory::ForecastingModel => "forecasting_model",
            EndpointCategory::TradingVenue => "trading_venue",
            EndpointCategory::RotationPool => "rotation_pool",
        }
    }
}

impl fmt::Display for EndpointCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_call_timeout() -> Duration {
    DEFAULT_CALL_TIMEOUT
}

/// An addressable downstream dependency. Immutable once configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique identifier (e.g., "exa", "deepseek/deepseek-r1:free")
    pub id: String,

    /// Dependency family
    pub category: EndpointCategory,

    /// Estimated cost of one call in USD
    #[serde(default)]
    pub cost_per_call: f64,

    /// Typical latency of one call
    #[serde(with = "duration", default)]
    pub expected_latency: Duration,

    /// Timeout applied to each individual attempt
    #[serde(with = "duration", default = "default_call_timeout")]
    pub call_timeout: Duration,

    /// Task affinity used by the rotation pool (e.g., "reasoning")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, category: EndpointCategory) -> Self {
        Self {
            id: id.into(),
            category,
            cost_per_call: 0.0,
            expected_latency: Duration::ZERO,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            affinity: None,
        }
    }

    pub fn with_cost(mut self, cost_per_call: f64) -> Self {
        self.cost_per_call = cost_per_call;
        self
    }

    pub fn with_expected_latency(mut self, latency: Duration) -> Self {
        self.expected_latency = latency;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_affinity(mut self, affinity: impl Into<String>) -> Self {
        self.affinity = Some(affinity.into());
        self
    }

    /// Whether this endpoint is tagged with the given task affinity.
    pub fn matches_affinity(&self, affinity: &str) -> bool {
        self.affinity.as_deref() == Some(affinity)
    }
}

/// One request entering the system.
///
/// The unit is never mutated after creation. Its remaining budget is
/// tracked by the runtime's budget tracker, seeded from `cost_budget`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Opaque id linking every call and event of this request
    pub correlation_id: String,

    /// Caller-defined request body
    pub payload: serde_json::Value,

    /// Spend allowed for this unit in USD
    pub cost_budget: f64,

    /// Time allowed for this unit, measured from when processing starts
    #[serde(with = "duration")]
    pub deadline: Duration,

    /// Submission time
    pub created_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn new(
        correlation_id: impl Into<String>,
        payload: serde_json::Value,
        cost_budget: f64,
        deadline: Duration,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
            cost_budget,
            deadline,
            created_at: Utc::now(),
        }
    }

    /// Reject units that cannot be processed at all.
    pub fn validate(&self) -> Result<(), CallError> {
        if self.correlation_id.trim().is_empty() {
            return Err(CallError::Validation("correlation_id is empty".to_string()));
        }
        if !self.cost_budget.is_finite() || self.cost_budget < 0.0 {
            return Err(CallError::Validation(format!(
                "cost_budget must be a non-negative amount, got {}",
                self.cost_budget
            )));
        }
        if self.deadline.is_zero() {
            return Err(CallError::Validation("deadline must be positive".to_string()));
        }
        Ok(())
    }

    /// Payload rendered as query text for search-style sources.
    ///
    /// String payloads are used verbatim; `{"query": "..."}` objects yield
    /// the query field; anything else is serialized as JSON.
    pub fn query_text(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => match map.get("query") {
                Some(serde_json::Value::String(q)) => q.clone(),
                _ => self.payload.to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// Output of one source or model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerResult {
    pub producer_id: String,

    /// Directional forecast or score
    pub value: f64,

    /// Producer's confidence in `value` (0.0 - 1.0)
    pub confidence: f64,

    /// Actual spend for this call in USD
    #[serde(default)]
    pub cost_incurred: f64,

    #[serde(with = "duration", default)]
    pub latency: Duration,

    /// Set by producers that answered but flagged their own output as unusable
    #[serde(default)]
    pub failed: bool,
}

impl ProducerResult {
    pub fn new(producer_id: impl Into<String>, value: f64, confidence: f64) -> Self {
        Self {
            producer_id: producer_id.into(),
            value,
            confidence,
            cost_incurred: 0.0,
            latency: Duration::ZERO,
            failed: false,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_incurred = cost;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// A result the producer itself marked as failed.
    pub fn failed(producer_id: impl Into<String>) -> Self {
        Self {
            failed: true,
            ..Self::new(producer_id, 0.0, 0.0)
        }
    }

    /// Whether this result may contribute to a consensus.
    pub fn is_usable(&self) -> bool {
        !self.failed
            && self.value.is_finite()
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
    }
}

/// Result of submitting an order to a trading venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub order_id: String,

    /// Whether the venue accepted the order
    pub accepted: bool,

    /// Signed filled notional (negative for sells)
    pub filled_value: f64,

    #[serde(default)]
    pub cost_incurred: f64,

    #[serde(with = "duration", default)]
    pub latency: Duration,
}

/// A producer left out of a consensus, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exclusion {
    pub producer_id: String,

    pub reason: String,

    /// Classified failure kind, if the producer failed with one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

/// Aggregate over at least two successful producer results. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    pub correlation_id: String,

    /// Confidence-weighted average of contributing values
    pub consensus_value: f64,

    pub consensus_confidence: f64,

    /// Fraction of contributors whose direction matches the majority
    pub agreement_ratio: f64,

    /// Producer ids that succeeded
    pub contributing: Vec<String>,

    /// Producers that failed, timed out, or were unusable
    pub excluded: Vec<Exclusion>,

    /// Total spend across contributing producers in USD
    pub total_cost: f64,

    /// Served from the result cache without calling producers
    #[serde(default)]
    pub cached: bool,

    pub completed_at: DateTime<Utc>,
}

impl EnsembleResult {
    pub fn excluded_ids(&self) -> Vec<&str> {
        self.excluded.iter().map(|e| e.producer_id.as_str()).collect()
    }

    /// Whether any producer was dropped from this result.
    pub fn is_degraded(&self) -> bool {
        !self.excluded.is_empty()
    }
}
