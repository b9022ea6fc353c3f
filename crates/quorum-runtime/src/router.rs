//! Cost-aware tier routing.
//!
//! Tiers are tried in order, cheapest first. A tier is skipped when it
//! breaks its own cost or latency ceiling, when the work unit's deadline
//! leaves no room for it, or when the budget cannot cover its estimated
//! cost. A tier that fails hands over to the next one; only when every
//! tier is gone does the caller see an error.

use quorum_core::{CallError, ConfigError, ProducerResult, QuorumConfig, TierConfig, WorkUnit};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{invalid, QuorumError, TierFailure};
use crate::events::{EventBus, EventPayload};
use crate::producers::{DynProducer, Outcome};
use crate::resilience::CostBudgetTracker;

/// One execution tier.
pub struct Tier<O = ProducerResult> {
    name: String,
    producer: DynProducer<O>,
    max_cost: f64,
    max_latency: Option<Duration>,
}

impl<O: Outcome> Tier<O> {
    /// A tier with no ceilings.
    pub fn new(name: impl Into<String>, producer: DynProducer<O>) -> Self {
        Self {
            name: name.into(),
            producer,
            max_cost: f64::INFINITY,
            max_latency: None,
        }
    }

    pub fn from_config(config: &TierConfig, producer: DynProducer<O>) -> Self {
        Self {
            name: config.name.clone(),
            producer,
            max_cost: config.max_cost,
            max_latency: config.max_latency,
        }
    }

    pub fn with_max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = max_cost;
        self
    }

    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = Some(max_latency);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Why this tier cannot be dispatched with `remaining` time left.
    fn ceiling_violation(&self, remaining: Duration) -> Option<String> {
        let endpoint = self.producer.endpoint();

        if endpoint.cost_per_call > self.max_cost {
            return Some(format!(
                "cost ${:.4} exceeds tier ceiling ${:.4}",
                endpoint.cost_per_call, self.max_cost
            ));
        }
        if let Some(max) = self.max_latency {
            if endpoint.expected_latency > max {
                return Some(format!(
                    "expected latency {:?} exceeds tier ceiling {:?}",
                    endpoint.expected_latency, max
                ));
            }
        }
        if remaining.is_zero() {
            return Some("deadline elapsed".to_string());
        }
        if endpoint.expected_latency > remaining {
            return Some(format!(
                "expected latency {:?} exceeds remaining deadline {:?}",
                endpoint.expected_latency, remaining
            ));
        }
        None
    }
}

/// Successful routing outcome.
#[derive(Debug, Clone)]
pub struct RoutedResult<O = ProducerResult> {
    /// Tier that served the unit
    pub tier: String,

    pub result: O,

    /// Cost charged to the budget
    pub cost: f64,

    /// Earlier tiers that were skipped or failed
    pub fallbacks: Vec<TierFailure>,

    pub latency: Duration,
}

/// Routes work units across ordered tiers.
pub struct TierRouter<O = ProducerResult> {
    tiers: Vec<Tier<O>>,
    budget: Arc<CostBudgetTracker>,
    events: Option<EventBus>,
}

impl<O: Outcome> TierRouter<O> {
    pub fn new(budget: Arc<CostBudgetTracker>) -> Self {
        Self {
            tiers: Vec::new(),
            budget,
            events: None,
        }
    }

    /// Build the configured tier order, taking each tier's producer from
    /// `producers` by endpoint id.
    pub fn from_config(
        config: &QuorumConfig,
        producers: &HashMap<String, DynProducer<O>>,
        budget: Arc<CostBudgetTracker>,
    ) -> Result<Self, QuorumError> {
        let mut router = Self::new(budget);
        for tier in &config.tiers {
            let producer = producers.get(&tier.endpoint).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "tier '{}': no producer registered for endpoint '{}'",
                    tier.name, tier.endpoint
                ))
            })?;
            router.tiers.push(Tier::from_config(tier, Arc::clone(producer)));
        }
        Ok(router)
    }

    /// Append a tier after the existing ones.
    pub fn with_tier(mut self, tier: Tier<O>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn budget(&self) -> &Arc<CostBudgetTracker> {
        &self.budget
    }

    /// Route one work unit.
    ///
    /// The unit's budget is tracked for the duration of the call unless
    /// the caller already opened it on the shared tracker, in which case
    /// it is left open.
    pub async fn route(&self, unit: &WorkUnit) -> Result<RoutedResult<O>, QuorumError> {
        unit.validate().map_err(invalid)?;

        let opened = self.budget.open_unit(unit);
        let outcome = self.route_tiers(unit).await;
        if opened {
            self.budget.close_unit(&unit.correlation_id);
        }

        let correlation_id = unit.correlation_id.as_str();
        match &outcome {
            Ok(routed) => {
                tracing::info!(
                    correlation_id,
                    tier = %routed.tier,
                    cost = routed.cost,
                    fallbacks = routed.fallbacks.len(),
                    "Work unit completed"
                );
                self.publish(
                    correlation_id,
                    EventPayload::WorkUnitCompleted {
                        tier: routed.tier.clone(),
                        cost: routed.cost,
                        fallbacks: routed.fallbacks.len(),
                        latency_ms: routed.latency.as_millis() as u64,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(correlation_id, error = %e, "Work unit failed");
                self.publish(correlation_id, EventPayload::WorkUnitFailed { reason: e.to_string() });
            }
        }
        outcome
    }

    async fn route_tiers(&self, unit: &WorkUnit) -> Result<RoutedResult<O>, QuorumError> {
        let correlation_id = unit.correlation_id.as_str();
        let started = Instant::now();
        let deadline = started + unit.deadline;
        let mut fallbacks = Vec::new();

        for tier in &self.tiers {
            let endpoint = tier.producer.endpoint();
            let remaining = deadline.saturating_duration_since(Instant::now());

            if let Some(reason) = tier.ceiling_violation(remaining) {
                self.abandon(correlation_id, TierFailure::skipped(&tier.name, reason), &mut fallbacks);
                continue;
            }

            let reservation = match self.budget.try_reserve(correlation_id, endpoint.cost_per_call) {
                Ok(reservation) => reservation,
                Err(e) => {
                    self.abandon(correlation_id, TierFailure::skipped(&tier.name, e.to_string()), &mut fallbacks);
                    continue;
                }
            };

            tracing::debug!(
                correlation_id,
                tier = %tier.name,
                endpoint = %endpoint.id,
                reserved = reservation.amount(),
                "Dispatching to tier"
            );

            let outcome = match tokio::time::timeout(remaining, tier.producer.call(unit)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(CallError::Timeout {
                    endpoint: endpoint.id.clone(),
                    after: remaining,
                }),
            };

            match outcome {
                Ok(result) => {
                    let cost = result.cost_incurred();
                    self.budget.settle(reservation, cost, &tier.name);
                    return Ok(RoutedResult {
                        tier: tier.name.clone(),
                        result,
                        cost,
                        fallbacks,
                        latency: started.elapsed(),
                    });
                }
                Err(e) => {
                    self.budget.refund(reservation);
                    if e.kind() == quorum_core::ErrorKind::Validation {
                        return Err(invalid(e));
                    }
                    self.abandon(correlation_id, TierFailure::failed(&tier.name, &e), &mut fallbacks);
                }
            }
        }

        Err(QuorumError::AllTiersExhausted {
            correlation_id: correlation_id.to_string(),
            failures: fallbacks,
        })
    }

    fn abandon(&self, correlation_id: &str, failure: TierFailure, fallbacks: &mut Vec<TierFailure>) {
        tracing::warn!(correlation_id, %failure, "Falling back from tier");
        self.publish(
            correlation_id,
            EventPayload::TierFallback {
                tier: failure.tier.clone(),
                reason: failure.reason.clone(),
                kind: failure.kind,
            },
        );
        fallbacks.push(failure);
    }

    fn publish(&self, correlation_id: &str, payload: EventPayload) {
        if let Some(events) = &self.events {
            events.publish("router", Some(correlation_id), payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producers::testing::ScriptedProducer;
    use crate::producers::GuardedProducer;
    use crate::resilience::{CircuitBreaker, RetryExecutor};
    use quorum_core::{BreakerSettings, Endpoint, EndpointCategory, ErrorKind};
    use serde_json::json;

    fn endpoint(id: &str, cost: f64) -> Endpoint {
        Endpoint::new(id, EndpointCategory::ForecastingModel).with_cost(cost)
    }

    fn unit(budget: f64) -> WorkUnit {
        WorkUnit::new("c1", json!({"momentum": 0.3}), budget, Duration::from_secs(30))
    }

    fn tracker() -> Arc<CostBudgetTracker> {
        Arc::new(CostBudgetTracker::new(10.0))
    }

    fn guarded(scripted: &Arc<ScriptedProducer>) -> DynProducer {
        let id = scripted.endpoint.id.clone();
        Arc::new(GuardedProducer::new(
            Arc::clone(scripted),
            Arc::new(CircuitBreaker::new(id, BreakerSettings::forecasting_model())),
            RetryExecutor::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_mid_when_free_exhausts_retries() {
        let free = Arc::new(ScriptedProducer::failing(
            endpoint("local", 0.0),
            CallError::inference("local", "diverged", true),
        ));
        let mid = Arc::new(ScriptedProducer::ok(endpoint("haiku", 0.05), 0.4, 0.8));
        let premium = Arc::new(ScriptedProducer::ok(endpoint("opus", 0.50), 0.5, 0.9));

        let router = TierRouter::new(tracker())
            .with_tier(Tier::new("free", guarded(&free)))
            .with_tier(Tier::new("mid", guarded(&mid)))
            .with_tier(Tier::new("premium", guarded(&premium)));

        let routed = router.route(&unit(0.10)).await.unwrap();

        assert_eq!(routed.tier, "mid");
        assert_eq!(routed.result.value, 0.4);
        assert_eq!(routed.cost, 0.05);
        assert_eq!(free.call_count(), 2);
        assert_eq!(premium.call_count(), 0);
        assert_eq!(routed.fallbacks.len(), 1);
        assert_eq!(routed.fallbacks[0].kind, Some(ErrorKind::InferenceTransient));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_selects_tier_over_remaining_budget() {
        let free = Arc::new(ScriptedProducer::failing(
            endpoint("local", 0.0),
            CallError::inference("local", "diverged", false),
        ));
        let mid = Arc::new(ScriptedProducer::failing(
            endpoint("haiku", 0.05),
            CallError::inference("haiku", "refused", false),
        ));
        let premium = Arc::new(ScriptedProducer::ok(endpoint("opus", 0.50), 0.5, 0.9));

        let budget = tracker();
        let router = TierRouter::new(Arc::clone(&budget))
            .with_tier(Tier::new("free", guarded(&free)))
            .with_tier(Tier::new("mid", guarded(&mid)))
            .with_tier(Tier::new("premium", guarded(&premium)));

        let err = router.route(&unit(0.10)).await.unwrap_err();

        match err {
            QuorumError::AllTiersExhausted { correlation_id, failures } => {
                assert_eq!(correlation_id, "c1");
                assert_eq!(failures.len(), 3);
                assert!(failures[0].was_attempted());
                assert!(failures[1].was_attempted());
                assert!(!failures[2].was_attempted());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(premium.call_count(), 0);
        // failed calls are refunded
        assert_eq!(budget.session_remaining(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_stops_routing() {
        let free = Arc::new(ScriptedProducer::failing(
            endpoint("local", 0.0),
            CallError::Validation("features missing 'momentum'".into()),
        ));
        let mid = Arc::new(ScriptedProducer::ok(endpoint("haiku", 0.05), 0.4, 0.8));

        let router = TierRouter::new(tracker())
            .with_tier(Tier::new("free", guarded(&free)))
            .with_tier(Tier::new("mid", guarded(&mid)));

        let err = router.route(&unit(1.0)).await.unwrap_err();
        assert!(matches!(err, QuorumError::Validation(ref m) if m.contains("momentum")));
        assert_eq!(mid.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_unit_is_rejected_before_dispatch() {
        let free = Arc::new(ScriptedProducer::ok(endpoint("local", 0.0), 0.1, 0.5));
        let router = TierRouter::new(tracker()).with_tier(Tier::new("free", guarded(&free)));

        let mut bad = unit(1.0);
        bad.correlation_id = " ".into();
        assert!(matches!(router.route(&bad).await, Err(QuorumError::Validation(_))));
        assert_eq!(free.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_ceilings_skip_without_calling() {
        let pricey = Arc::new(ScriptedProducer::ok(endpoint("sonnet", 0.02), 0.1, 0.5));
        let slow = Arc::new(ScriptedProducer::ok(
            endpoint("opus", 0.0).with_expected_latency(Duration::from_secs(45)),
            0.2,
            0.5,
        ));
        let fallback = Arc::new(ScriptedProducer::ok(endpoint("local", 0.0), 0.3, 0.5));

        let router = TierRouter::new(tracker())
            .with_tier(Tier::new("capped", guarded(&pricey)).with_max_cost(0.01))
            .with_tier(Tier::new("slow", guarded(&slow)))
            .with_tier(Tier::new("local", guarded(&fallback)));

        let routed = router.route(&unit(1.0)).await.unwrap();
        assert_eq!(routed.tier, "local");
        assert!(routed.fallbacks[0].reason.contains("tier ceiling"));
        assert!(routed.fallbacks[1].reason.contains("remaining deadline"));
        assert_eq!(pricey.call_count() + slow.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_the_tier_call() {
        let stuck = Arc::new(
            ScriptedProducer::ok(endpoint("local", 0.0), 0.1, 0.5).with_delay(Duration::from_secs(60)),
        );
        let next = Arc::new(ScriptedProducer::ok(endpoint("haiku", 0.01), 0.2, 0.5));

        let router = TierRouter::new(tracker())
            .with_tier(Tier::new("free", Arc::clone(&stuck) as DynProducer))
            .with_tier(Tier::new("mid", Arc::clone(&next) as DynProducer));

        let started = Instant::now();
        let err = router.route(&unit(1.0)).await.unwrap_err();
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        let QuorumError::AllTiersExhausted { failures, .. } = err else {
            panic!("expected tier exhaustion");
        };
        assert_eq!(failures[0].kind, Some(ErrorKind::Transient));
        assert_eq!(failures[1].reason, "deadline elapsed");
        assert_eq!(next.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_settles_actual_cost() {
        let mid = Arc::new(ScriptedProducer::new(
            endpoint("haiku", 0.05),
            vec![Ok(ProducerResult::new("haiku", 0.4, 0.8).with_cost(0.03))],
        ));
        let budget = tracker();
        let router = TierRouter::new(Arc::clone(&budget)).with_tier(Tier::new("mid", guarded(&mid)));

        let routed = router.route(&unit(1.0)).await.unwrap();
        assert_eq!(routed.cost, 0.03);

        let summary = budget.summary();
        assert_eq!(summary.calls, 1);
        assert!((summary.by_label["mid"] - 0.03).abs() < 1e-9);
        assert!((budget.session_remaining() - 9.97).abs() < 1e-9);
        // the router opened the unit, so it closed it again
        assert!(budget.close_unit("c1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_fallback_and_completion_events() {
        let free = Arc::new(ScriptedProducer::failing(
            endpoint("local", 0.0),
            CallError::inference("local", "diverged", false),
        ));
        let mid = Arc::new(ScriptedProducer::ok(endpoint("haiku", 0.05), 0.4, 0.8));
        let events = EventBus::default();
        let mut subscription = events.subscribe();

        let router = TierRouter::new(tracker())
            .with_events(events)
            .with_tier(Tier::new("free", guarded(&free)))
            .with_tier(Tier::new("mid", guarded(&mid)));
        router.route(&unit(1.0)).await.unwrap();

        let fallback = subscription.try_next().unwrap();
        assert_eq!(fallback.event_type(), "tier_fallback");
        assert_eq!(fallback.correlation_id.as_deref(), Some("c1"));

        let completed = subscription.try_next().unwrap();
        match completed.payload {
            EventPayload::WorkUnitCompleted { tier, fallbacks, .. } => {
                assert_eq!(tier, "mid");
                assert_eq!(fallbacks, 1);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_from_config_requires_every_tier_producer() {
        let config = QuorumConfig::from_yaml(
            r#"
endpoints:
  - id: local
    category: forecasting_model
  - id: haiku
    category: forecasting_model
    cost_per_call: 0.05
tiers:
  - name: free
    endpoint: local
    max_cost: 0.0
  - name: mid
    endpoint: haiku
    max_cost: 0.10
"#,
        )
        .unwrap();

        let mut producers: HashMap<String, DynProducer> = HashMap::new();
        producers.insert(
            "local".into(),
            Arc::new(ScriptedProducer::ok(endpoint("local", 0.0), 0.1, 0.5)),
        );
        assert!(matches!(
            TierRouter::from_config(&config, &producers, tracker()),
            Err(QuorumError::Config(_))
        ));

        producers.insert(
            "haiku".into(),
            Arc::new(ScriptedProducer::ok(endpoint("haiku", 0.05), 0.1, 0.5)),
        );
        let router = TierRouter::from_config(&config, &producers, tracker()).unwrap();
        assert_eq!(router.tier_names(), vec!["free", "mid"]);
    }
}
