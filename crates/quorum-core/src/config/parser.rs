//! Configuration parsing from YAML/JSON.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::duration;
use super::schema::validate_config_schema;
use crate::error::ErrorKind;
use crate::types::{Endpoint, EndpointCategory};

lazy_static! {
    static ref ENDPOINT_ID: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/:@-]*$")
        .expect("endpoint id pattern is valid");
}

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config does not match schema: {}", .0.join("; "))]
    SchemaError(Vec<String>),

    #[error("Config validation failed: {0}")]
    ValidationError(String),
}

/// Circuit breaker thresholds for one endpoint category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Failures within the window before opening
    pub failure_threshold: u32,

    /// Rolling window failures are counted in
    #[serde(with = "duration")]
    pub failure_window: Duration,

    /// How long the circuit stays open before admitting a probe
    #[serde(with = "duration")]
    pub open_duration: Duration,

    /// How long a half-open probe may stay outstanding before another is admitted
    #[serde(with = "duration")]
    pub probe_interval: Duration,
}

impl BreakerSettings {
    pub fn new(failure_threshold: u32, window_secs: u64, open_secs: u64, probe_secs: u64) -> Self {
        Self {
            failure_threshold,
            failure_window: Duration::from_secs(window_secs),
            open_duration: Duration::from_secs(open_secs),
            probe_interval: Duration::from_secs(probe_secs),
        }
    }

    pub fn intelligence_source() -> Self {
        Self::new(5, 60, 120, 30)
    }

    pub fn forecasting_model() -> Self {
        Self::new(3, 60, 600, 60)
    }

    pub fn trading_venue() -> Self {
        Self::new(5, 120, 300, 60)
    }

    pub fn rotation_pool() -> Self {
        Self::new(3, 30, 60, 15)
    }

    pub fn defaults_for(category: EndpointCategory) -> Self {
        match category {
            EndpointCategory::IntelligenceSource => Self::intelligence_source(),
            EndpointCategory::ForecastingModel => Self::forecasting_model(),
            EndpointCategory::TradingVenue => Self::trading_venue(),
            EndpointCategory::RotationPool => Self::rotation_pool(),
        }
    }
}

/// Breaker settings per endpoint category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTable {
    #[serde(default = "BreakerSettings::intelligence_source")]
    pub intelligence_source: BreakerSettings,

    #[serde(default = "BreakerSettings::forecasting_model")]
    pub forecasting_model: BreakerSettings,

    #[serde(default = "BreakerSettings::trading_venue")]
    pub trading_venue: BreakerSettings,

    #[serde(default = "BreakerSettings::rotation_pool")]
    pub rotation_pool: BreakerSettings,
}

impl Default for BreakerTable {
    fn default() -> Self {
        Self {
            intelligence_source: BreakerSettings::intelligence_source(),
            forecasting_model: BreakerSettings::forecasting_model(),
            trading_venue: BreakerSettings::trading_venue(),
            rotation_pool: BreakerSettings::rotation_pool(),
        }
    }
}

impl BreakerTable {
    pub fn for_category(&self, category: EndpointCategory) -> &BreakerSettings {
        match category {
            EndpointCategory::IntelligenceSource => &self.intelligence_source,
            EndpointCategory::ForecastingModel => &self.forecasting_model,
            EndpointCategory::TradingVenue => &self.trading_venue,
            EndpointCategory::RotationPool => &self.rotation_pool,
        }
    }
}

/// Backoff policy attached to one error kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations allowed; 0 and 1 both mean "never retried"
    pub max_attempts: u32,

    #[serde(with = "duration")]
    pub base_delay: Duration,

    #[serde(with = "duration")]
    pub max_delay: Duration,

    /// Randomize each delay uniformly within [0.5x, 1.5x]
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Policy for kinds that must never be retried.
    pub fn never() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO, false)
    }

    pub fn transient() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30), true)
    }

    pub fn rate_limit() -> Self {
        Self::new(5, Duration::from_secs(2), Duration::from_secs(60), true)
    }

    pub fn execution_transient() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(5), false)
    }

    pub fn inference_transient() -> Self {
        Self::new(2, Duration::from_millis(500), Duration::from_secs(5), true)
    }

    /// Number of invocations this policy permits (at least one).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Un-jittered delay before retry number `retry` (0-based):
    /// `min(base_delay * 2^retry, max_delay)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every un-jittered delay this policy will wait, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.attempts() - 1).map(|i| self.delay_for(i)).collect()
    }
}

/// Retry policies per error kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTable {
    #[serde(default = "RetryPolicy::transient")]
    pub transient: RetryPolicy,

    #[serde(default = "RetryPolicy::rate_limit")]
    pub rate_limit: RetryPolicy,

    #[serde(default = "RetryPolicy::execution_transient")]
    pub execution_transient: RetryPolicy,

    #[serde(default = "RetryPolicy::inference_transient")]
    pub inference_transient: RetryPolicy,

    #[serde(default = "RetryPolicy::never")]
    pub validation: RetryPolicy,
}

impl Default for RetryTable {
    fn default() -> Self {
        Self {
            transient: RetryPolicy::transient(),
            rate_limit: RetryPolicy::rate_limit(),
            execution_transient: RetryPolicy::execution_transient(),
            inference_transient: RetryPolicy::inference_transient(),
            validation: RetryPolicy::never(),
        }
    }
}

impl RetryTable {
    /// Policy governing failures of the given kind.
    ///
    /// Non-retryable kinds always get [`RetryPolicy::never`].
    pub fn policy_for(&self, kind: ErrorKind) -> RetryPolicy {
        match kind {
            ErrorKind::Transient => self.transient.clone(),
            ErrorKind::RateLimit => self.rate_limit.clone(),
            ErrorKind::ExecutionTransient => self.execution_transient.clone(),
            ErrorKind::InferenceTransient => self.inference_transient.clone(),
            ErrorKind::Validation
            | ErrorKind::ExecutionRejected
            | ErrorKind::InferenceFailure
            | ErrorKind::CircuitOpen => RetryPolicy::never(),
        }
    }

    fn entries(&self) -> [(&'static str, &RetryPolicy); 5] {
        [
            ("transient", &self.transient),
            ("rate_limit", &self.rate_limit),
            ("execution_transient", &self.execution_transient),
            ("inference_transient", &self.inference_transient),
            ("validation", &self.validation),
        ]
    }
}

/// One execution tier, cheapest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name (e.g., "free", "mid", "premium")
    pub name: String,

    /// Id of the endpoint serving this tier
    pub endpoint: String,

    /// Highest per-call cost this tier may be dispatched at
    pub max_cost: f64,

    /// Skip the tier when its expected latency exceeds this
    #[serde(with = "duration::option", default, skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<Duration>,
}

/// What the rotator does when every pool endpoint is excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Clear all exclusions and select once more
    #[default]
    ClearAndRetry,

    /// Wait for the earliest exclusion to lapse if it does so within `max_wait`
    Wait {
        #[serde(with = "duration")]
        max_wait: Duration,
    },

    /// Fail immediately
    Fail,
}

fn default_exclusion() -> Duration {
    Duration::from_secs(60)
}

/// Rotation pool membership and exclusion policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Endpoint ids in rotation order
    #[serde(default)]
    pub pool: Vec<String>,

    /// Exclusion applied when an endpoint is rate limited without a hint
    #[serde(with = "duration", default = "default_exclusion")]
    pub exclusion: Duration,

    #[serde(default)]
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            pool: Vec::new(),
            exclusion: default_exclusion(),
            on_exhausted: ExhaustionPolicy::default(),
        }
    }
}

/// Minimum number of producers an ensemble needs.
pub const MIN_PRODUCERS: usize = 2;

/// Ensemble fan-out settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Barrier for the whole fan-out
    #[serde(with = "duration")]
    pub deadline: Duration,

    /// Successful producers required for a consensus (never below 2)
    pub min_producers: usize,

    /// Lifetime of cached ensemble results
    #[serde(with = "duration")]
    pub cache_ttl: Duration,

    /// Maximum cached ensemble results; 0 disables the cache
    pub cache_capacity: u64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(20),
            min_producers: MIN_PRODUCERS,
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 10_000,
        }
    }
}

/// Session-wide spend ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// USD available to the whole session
    pub session_max: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self { session_max: 10.0 }
    }
}

/// Complete Quorum configuration.
///
/// Every section is optional; an empty document yields the documented
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuorumConfig {
    #[serde(default)]
    pub breakers: BreakerTable,

    #[serde(default)]
    pub retry: RetryTable,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,

    #[serde(default)]
    pub tiers: Vec<TierConfig>,

    #[serde(default)]
    pub rotation: RotationConfig,

    #[serde(default)]
    pub ensemble: EnsembleConfig,

    #[serde(default)]
    pub budget: BudgetConfig,
}

impl QuorumConfig {
    /// Parse a config from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Self::from_value(serde_json::Value::Null);
        }
        let document: serde_json::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(document)
    }

    /// Parse a config from JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let document: serde_json::Value = serde_json::from_str(json)?;
        Self::from_value(document)
    }

    /// Parse a config file; `.json` files are read as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }

    fn from_value(document: serde_json::Value) -> Result<Self, ConfigError> {
        // An empty YAML document parses as null
        let document = if document.is_null() {
            serde_json::json!({})
        } else {
            document
        };

        validate_config_schema(&document).map_err(ConfigError::SchemaError)?;

        let config: QuorumConfig = serde_json::from_value(document)?;
        config.validate()?;
        tracing::debug!(
            endpoints = config.endpoints.len(),
            tiers = config.tiers.len(),
            pool = config.rotation.pool.len(),
            "Config loaded"
        );
        Ok(config)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Look up a configured endpoint by id.
    pub fn endpoint(&self, id: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }

    /// Pool endpoints in configured rotation order.
    pub fn rotation_endpoints(&self) -> Vec<Endpoint> {
        self.rotation
            .pool
            .iter()
            .filter_map(|id| self.endpoint(id).cloned())
            .collect()
    }

    /// Check cross-field invariants the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !ENDPOINT_ID.is_match(&endpoint.id) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid endpoint id: '{}'",
                    endpoint.id
                )));
            }
            if !seen.insert(endpoint.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate endpoint id: {}",
                    endpoint.id
                )));
            }
            if !endpoint.cost_per_call.is_finite() || endpoint.cost_per_call < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "Endpoint {} has invalid cost_per_call {}",
                    endpoint.id, endpoint.cost_per_call
                )));
            }
            if endpoint.call_timeout >= self.ensemble.deadline {
                return Err(ConfigError::ValidationError(format!(
                    "Endpoint {} call_timeout {:?} must be shorter than the ensemble deadline {:?}",
                    endpoint.id, endpoint.call_timeout, self.ensemble.deadline
                )));
            }
        }

        let mut tier_names = HashSet::new();
        for tier in &self.tiers {
            if !tier_names.insert(tier.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate tier name: {}",
                    tier.name
                )));
            }
            if self.endpoint(&tier.endpoint).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Tier {} references unknown endpoint {}",
                    tier.name, tier.endpoint
                )));
            }
        }

        let mut pool_members = HashSet::new();
        for id in &self.rotation.pool {
            if self.endpoint(id).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Rotation pool references unknown endpoint {}",
                    id
                )));
            }
            if !pool_members.insert(id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Endpoint {} listed twice in rotation pool",
                    id
                )));
            }
        }

        for (kind, policy) in self.retry.entries() {
            if policy.base_delay > policy.max_delay {
                return Err(ConfigError::ValidationError(format!(
                    "retry.{}: base_delay exceeds max_delay",
                    kind
                )));
            }
        }
        if self.retry.validation.max_attempts > 1 {
            return Err(ConfigError::ValidationError(
                "retry.validation: validation failures are never retried".to_string(),
            ));
        }

        for category in EndpointCategory::ALL {
            if self.breakers.for_category(category).failure_threshold == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "breakers.{}: failure_threshold must be at least 1",
                    category
                )));
            }
        }

        if self.ensemble.min_producers < MIN_PRODUCERS {
            return Err(ConfigError::ValidationError(format!(
                "ensemble.min_producers must be at least {}",
                MIN_PRODUCERS
            )));
        }

        if !self.budget.session_max.is_finite() || self.budget.session_max < 0.0 {
            return Err(ConfigError::ValidationError(
                "budget.session_max must be a non-negative amount".to_string(),
            ));
        }

        Ok(())
    }
}
