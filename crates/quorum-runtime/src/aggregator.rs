//! Ensemble fan-out and consensus.
//!
//! Every producer is called concurrently on its own task. The fan-in waits
//! until all tasks finish or the deadline passes, whichever comes first;
//! tasks still running at the deadline are aborted and their producers
//! excluded. Retrying is the producers' business, never the aggregator's.
//!
//! A consensus needs at least two successful producers. One success is a
//! failure, not a degraded answer.
//!
//! Each producer's `cost_per_call` is reserved against the work unit and
//! session budgets before it is spawned. A producer the budget cannot cover
//! is excluded without being called.

use quorum_core::{
    CallError, ConsensusEngine, EnsembleConfig, EnsembleResult, ErrorKind, Exclusion,
    ProducerResult, QuorumConfig, WorkUnit, MIN_PRODUCERS,
};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::cache::{EnsembleCache, EnsembleKey};
use crate::error::{invalid, QuorumError};
use crate::events::{EventBus, EventPayload};
use crate::producers::DynProducer;
use crate::resilience::{CostBudgetTracker, Reservation};

/// Fans a work unit out to a producer set and folds the answers.
pub struct EnsembleAggregator {
    config: EnsembleConfig,
    engine: ConsensusEngine,
    cache: Option<EnsembleCache>,
    budget: Arc<CostBudgetTracker>,
    events: Option<EventBus>,
}

impl EnsembleAggregator {
    pub fn new(config: EnsembleConfig) -> Self {
        let cache = EnsembleCache::from_config(&config);
        Self {
            config,
            engine: ConsensusEngine::new(),
            cache,
            budget: Arc::new(CostBudgetTracker::default()),
            events: None,
        }
    }

    pub fn from_config(config: &QuorumConfig) -> Self {
        Self::new(config.ensemble.clone())
            .with_budget(Arc::new(CostBudgetTracker::from_config(&config.budget)))
    }

    /// Charge producer calls to a shared tracker, e.g. the router's.
    pub fn with_budget(mut self, budget: Arc<CostBudgetTracker>) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> &Arc<CostBudgetTracker> {
        &self.budget
    }

    pub fn without_cache(mut self) -> Self {
        self.cache = None;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<&EnsembleCache> {
        self.cache.as_ref()
    }

    /// Successful producers a consensus needs.
    pub fn required(&self) -> usize {
        self.config.min_producers.max(MIN_PRODUCERS)
    }

    /// Call every producer for `unit` and compute their consensus.
    pub async fn aggregate(
        &self,
        unit: &WorkUnit,
        producers: &[DynProducer],
    ) -> Result<EnsembleResult, QuorumError> {
        unit.validate().map_err(invalid)?;
        let correlation_id = unit.correlation_id.as_str();
        let required = self.required();

        if producers.len() < required {
            tracing::warn!(
                correlation_id,
                producers = producers.len(),
                required,
                "Producer set too small for a consensus"
            );
            return Err(self.insufficient(correlation_id, 0, required, Vec::new()));
        }

        let key = EnsembleKey::new(unit, producers.iter().map(|p| p.id()));
        if let Some(cache) = &self.cache {
            if let Some(mut hit) = cache.get(&key).await {
                tracing::debug!(correlation_id, "Ensemble served from cache");
                hit.correlation_id = correlation_id.to_string();
                hit.cached = true;
                self.completed(&hit);
                return Ok(hit);
            }
        }

        let opened = self.budget.open_unit(unit);
        let outcomes = self.fan_out(unit, producers).await;
        if opened {
            self.budget.close_unit(correlation_id);
        }

        let mut contributors: Vec<ProducerResult> = Vec::new();
        let mut excluded: Vec<Exclusion> = Vec::new();
        for (producer, outcome) in producers.iter().zip(outcomes) {
            let producer_id = producer.id().to_string();
            match outcome {
                Slot::Done(Ok(mut result)) if result.is_usable() => {
                    result.producer_id = producer_id;
                    contributors.push(result);
                }
                Slot::Done(Ok(_)) => excluded.push(Exclusion {
                    producer_id,
                    reason: "unusable result".to_string(),
                    kind: Some(ErrorKind::InferenceFailure),
                }),
                Slot::Done(Err(e)) => excluded.push(Exclusion {
                    producer_id,
                    reason: e.to_string(),
                    kind: Some(e.kind()),
                }),
                Slot::TimedOut => excluded.push(Exclusion {
                    producer_id,
                    reason: "deadline elapsed".to_string(),
                    kind: None,
                }),
                Slot::Lost => excluded.push(Exclusion {
                    producer_id,
                    reason: "producer task failed".to_string(),
                    kind: None,
                }),
                Slot::Unaffordable(reason) => excluded.push(Exclusion {
                    producer_id,
                    reason,
                    kind: None,
                }),
            }
        }

        for exclusion in &excluded {
            tracing::debug!(
                correlation_id,
                producer = %exclusion.producer_id,
                reason = %exclusion.reason,
                "Producer excluded from consensus"
            );
        }

        if contributors.len() < required {
            return Err(self.insufficient(correlation_id, contributors.len(), required, excluded));
        }

        let Some(consensus) = self.engine.compute(&contributors) else {
            return Err(self.insufficient(correlation_id, 0, required, excluded));
        };
        let result = self.engine.into_result(correlation_id, &consensus, &contributors, excluded);

        tracing::info!(
            correlation_id,
            consensus_value = result.consensus_value,
            agreement_ratio = result.agreement_ratio,
            contributing = result.contributing.len(),
            excluded = result.excluded.len(),
            "Ensemble completed"
        );

        // Degraded answers are not reused
        if let Some(cache) = &self.cache {
            if !result.is_degraded() {
                cache.insert(key, result.clone()).await;
            }
        }

        self.completed(&result);
        Ok(result)
    }

    /// One slot per producer, in producer order.
    ///
    /// Reservations are settled with the reported cost of each successful
    /// call and refunded for everything else.
    async fn fan_out(&self, unit: &WorkUnit, producers: &[DynProducer]) -> Vec<Slot> {
        let correlation_id = unit.correlation_id.as_str();
        let deadline = Instant::now() + self.config.deadline.min(unit.deadline);
        let shared = Arc::new(unit.clone());

        let mut reservations: Vec<Option<Reservation>> = Vec::with_capacity(producers.len());
        let mut unaffordable: Vec<Option<String>> = vec![None; producers.len()];
        let mut tasks = JoinSet::new();
        for (index, producer) in producers.iter().enumerate() {
            let cost = producer.endpoint().cost_per_call;
            match self.budget.try_reserve(correlation_id, cost) {
                Ok(reservation) => reservations.push(Some(reservation)),
                Err(e) => {
                    tracing::debug!(
                        correlation_id,
                        producer = %producer.id(),
                        cost,
                        "Producer skipped, budget cannot cover it"
                    );
                    reservations.push(None);
                    unaffordable[index] = Some(e.to_string());
                    continue;
                }
            }
            let producer = Arc::clone(producer);
            let unit = Arc::clone(&shared);
            tasks.spawn(async move { (index, producer.call(&unit).await) });
        }

        let mut slots: Vec<Option<Result<ProducerResult, CallError>>> = vec![None; producers.len()];
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, outcome)))) => slots[index] = Some(outcome),
                Ok(Some(Err(e))) => {
                    tracing::error!(correlation_id = %unit.correlation_id, error = %e, "Producer task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    tracing::warn!(
                        correlation_id = %unit.correlation_id,
                        outstanding = tasks.len(),
                        "Ensemble deadline elapsed, cancelling outstanding producers"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        for ((producer, slot), reservation) in producers.iter().zip(&slots).zip(reservations) {
            let Some(reservation) = reservation else {
                continue;
            };
            match slot {
                Some(Ok(result)) => self.budget.settle(reservation, result.cost_incurred, producer.id()),
                _ => self.budget.refund(reservation),
            }
        }

        slots
            .into_iter()
            .zip(unaffordable)
            .map(|(slot, unaffordable)| match (slot, unaffordable) {
                (_, Some(reason)) => Slot::Unaffordable(reason),
                (Some(outcome), None) => Slot::Done(outcome),
                (None, None) if timed_out => Slot::TimedOut,
                (None, None) => Slot::Lost,
            })
            .collect()
    }

    fn insufficient(
        &self,
        correlation_id: &str,
        succeeded: usize,
        required: usize,
        excluded: Vec<Exclusion>,
    ) -> QuorumError {
        tracing::warn!(correlation_id, succeeded, required, "Ensemble failed");
        if let Some(events) = &self.events {
            events.publish(
                "aggregator",
                Some(correlation_id),
                EventPayload::EnsembleFailed {
                    succeeded,
                    required,
                    excluded: excluded.iter().map(|e| e.producer_id.clone()).collect(),
                },
            );
        }
        QuorumError::InsufficientProducers {
            succeeded,
            required,
            excluded,
        }
    }

    fn completed(&self, result: &EnsembleResult) {
        if let Some(events) = &self.events {
            events.publish(
                "aggregator",
                Some(&result.correlation_id),
                EventPayload::EnsembleCompleted {
                    consensus_value: result.consensus_value,
                    consensus_confidence: result.consensus_confidence,
                    agreement_ratio: result.agreement_ratio,
                    contributing: result.contributing.clone(),
                    excluded: result.excluded.iter().map(|e| e.producer_id.clone()).collect(),
                    cached: result.cached,
                },
            );
        }
    }
}

impl Default for EnsembleAggregator {
    fn default() -> Self {
        Self::new(EnsembleConfig::default())
    }
}

enum Slot {
    Done(Result<ProducerResult, CallError>),
    TimedOut,
    Lost,
    Unaffordable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::producers::testing::ScriptedProducer;
    use quorum_core::{Endpoint, EndpointCategory};
    use serde_json::json;
    use std::time::Duration;

    fn endpoint(id: &str) -> Endpoint {
        Endpoint::new(id, EndpointCategory::ForecastingModel).with_cost(0.01)
    }

    fn ok(id: &str, value: f64, confidence: f64) -> Arc<ScriptedProducer> {
        Arc::new(ScriptedProducer::ok(endpoint(id), value, confidence))
    }

    fn failing(id: &str) -> Arc<ScriptedProducer> {
        Arc::new(ScriptedProducer::failing(
            endpoint(id),
            CallError::inference(id, "diverged", false),
        ))
    }

    fn slow(id: &str, value: f64) -> Arc<ScriptedProducer> {
        Arc::new(ScriptedProducer::ok(endpoint(id), value, 0.5).with_delay(Duration::from_secs(60)))
    }

    fn set(producers: &[&Arc<ScriptedProducer>]) -> Vec<DynProducer> {
        producers.iter().map(|p| Arc::clone(*p) as DynProducer).collect()
    }

    fn unit(id: &str) -> WorkUnit {
        WorkUnit::new(id, json!({"ticker": "FED"}), 1.0, Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_of_five_reach_consensus() {
        let (a, b) = (ok("a", 0.8, 0.9), ok("b", 0.6, 0.7));
        let (c, d, e) = (failing("c"), failing("d"), failing("e"));
        let aggregator = EnsembleAggregator::default();

        let result = aggregator
            .aggregate(&unit("c1"), &set(&[&a, &c, &b, &d, &e]))
            .await
            .unwrap();

        assert!((result.consensus_value - 0.7125).abs() < 1e-9);
        assert_eq!(result.agreement_ratio, 1.0);
        assert_eq!(result.contributing, vec!["a", "b"]);
        assert_eq!(result.excluded_ids(), vec!["c", "d", "e"]);
        assert_eq!(result.excluded[0].kind, Some(ErrorKind::InferenceFailure));
        assert!((result.total_cost - 0.02).abs() < 1e-9);
        assert!(!result.cached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_success_is_insufficient() {
        let a = ok("a", 0.8, 0.9);
        let rest: Vec<_> = ["b", "c", "d", "e"].iter().map(|id| failing(id)).collect();
        let mut producers = set(&[&a]);
        producers.extend(rest.iter().map(|p| Arc::clone(p) as DynProducer));

        let err = EnsembleAggregator::default()
            .aggregate(&unit("c1"), &producers)
            .await
            .unwrap_err();

        match err {
            QuorumError::InsufficientProducers { succeeded, required, excluded } => {
                assert_eq!(succeeded, 1);
                assert_eq!(required, 2);
                assert_eq!(excluded.len(), 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_few_producers_fails_without_calling() {
        let a = ok("a", 0.8, 0.9);
        let err = EnsembleAggregator::default()
            .aggregate(&unit("c1"), &set(&[&a]))
            .await
            .unwrap_err();

        assert!(matches!(err, QuorumError::InsufficientProducers { succeeded: 0, .. }));
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_excludes_stragglers() {
        let (a, b, c) = (ok("a", 0.4, 0.6), ok("b", -0.2, 0.5), slow("c", 0.9));
        let started = Instant::now();

        let result = EnsembleAggregator::default()
            .aggregate(&unit("c1"), &set(&[&a, &b, &c]))
            .await
            .unwrap();

        // ensemble deadline (20s) is tighter than the unit's (30s)
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(result.contributing, vec!["a", "b"]);
        assert_eq!(result.excluded[0].producer_id, "c");
        assert_eq!(result.excluded[0].reason, "deadline elapsed");
        assert_eq!(result.agreement_ratio, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_with_one_success_is_insufficient() {
        let (a, b, c) = (ok("a", 0.4, 0.6), slow("b", 0.1), slow("c", 0.2));
        let mut short = unit("c1");
        short.deadline = Duration::from_secs(5);
        let started = Instant::now();

        let err = EnsembleAggregator::default()
            .aggregate(&short, &set(&[&a, &b, &c]))
            .await
            .unwrap_err();

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert!(matches!(err, QuorumError::InsufficientProducers { succeeded: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unusable_results_are_excluded() {
        let a = ok("a", 0.4, 0.6);
        let b = ok("b", 0.3, 0.6);
        let flagged = Arc::new(ScriptedProducer::new(endpoint("f"), vec![Ok(ProducerResult::failed("f"))]));
        let wild = ok("w", 0.3, 1.7);

        let result = EnsembleAggregator::default()
            .aggregate(&unit("c1"), &set(&[&a, &flagged, &b, &wild]))
            .await
            .unwrap();

        assert_eq!(result.contributing, vec!["a", "b"]);
        assert_eq!(result.excluded_ids(), vec!["f", "w"]);
        assert!(result.excluded.iter().all(|e| e.reason == "unusable result"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_producers() {
        let (a, b) = (ok("a", 0.8, 0.9), ok("b", 0.6, 0.7));
        let aggregator = EnsembleAggregator::default();

        let first = aggregator.aggregate(&unit("c1"), &set(&[&a, &b])).await.unwrap();
        let second = aggregator.aggregate(&unit("c2"), &set(&[&b, &a])).await.unwrap();

        assert!(second.cached);
        assert_eq!(second.correlation_id, "c2");
        assert_eq!(second.consensus_value, first.consensus_value);
        assert_eq!(a.call_count(), 1);
        assert_eq!(b.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_result_is_not_cached() {
        let (a, b, c) = (ok("a", 0.8, 0.9), ok("b", 0.6, 0.7), failing("c"));
        let aggregator = EnsembleAggregator::default();

        aggregator.aggregate(&unit("c1"), &set(&[&a, &b, &c])).await.unwrap();
        let again = aggregator.aggregate(&unit("c1"), &set(&[&a, &b, &c])).await.unwrap();

        assert!(!again.cached);
        assert_eq!(a.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_ensemble_events() {
        let events = EventBus::default();
        let mut subscription = events.subscribe();
        let aggregator = EnsembleAggregator::default().without_cache().with_events(events);
        let (a, b, c) = (ok("a", 0.8, 0.9), ok("b", 0.6, 0.7), failing("c"));

        aggregator.aggregate(&unit("c1"), &set(&[&a, &b, &c])).await.unwrap();
        let completed = subscription.try_next().unwrap();
        assert_eq!(completed.correlation_id.as_deref(), Some("c1"));
        match completed.payload {
            EventPayload::EnsembleCompleted { excluded, cached, .. } => {
                assert_eq!(excluded, vec!["c"]);
                assert!(!cached);
            }
            other => panic!("unexpected payload: {other:?}"),
        }

        let _ = aggregator.aggregate(&unit("c2"), &set(&[&a, &c])).await;
        let failed = subscription.try_next().unwrap();
        assert_eq!(failed.event_type(), "ensemble_failed");
        assert_eq!(failed.correlation_id.as_deref(), Some("c2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_budget_limits_dispatch() {
        let (a, b, c) = (ok("a", 0.8, 0.9), ok("b", 0.6, 0.7), ok("c", 0.5, 0.6));
        let aggregator = EnsembleAggregator::default().without_cache();
        let tight = WorkUnit::new("c1", json!({"ticker": "FED"}), 0.015, Duration::from_secs(30));

        let err = aggregator
            .aggregate(&tight, &set(&[&a, &b, &c]))
            .await
            .unwrap_err();

        assert_eq!((a.call_count(), b.call_count(), c.call_count()), (1, 0, 0));
        match err {
            QuorumError::InsufficientProducers { succeeded, excluded, .. } => {
                assert_eq!(succeeded, 1);
                assert_eq!(excluded.len(), 2);
                assert!(excluded.iter().all(|e| e.reason.starts_with("Budget exceeded")));
            }
            other => panic!("unexpected error: {other}"),
        }

        let summary = aggregator.budget().summary();
        assert_eq!(summary.calls, 1);
        assert!((summary.total_cost - 0.01).abs() < 1e-9);
        assert!(summary.total_cost <= tight.cost_budget);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_successful_calls_are_charged() {
        let (a, b) = (ok("a", 0.4, 0.6), ok("b", 0.3, 0.5));
        let (c, d) = (failing("c"), slow("d", 0.9));
        let budget = Arc::new(CostBudgetTracker::new(1.0));
        let aggregator = EnsembleAggregator::default()
            .without_cache()
            .with_budget(Arc::clone(&budget));

        aggregator.aggregate(&unit("c1"), &set(&[&a, &b, &c, &d])).await.unwrap();

        assert!((budget.session_remaining() - 0.98).abs() < 1e-9);
        assert_eq!(budget.summary().by_label.len(), 2);
        // the unit opened by the aggregator is closed again
        assert_eq!(budget.close_unit("c1"), None);
    }

    #[test]
    fn test_minimum_never_drops_below_two() {
        let aggregator = EnsembleAggregator::new(EnsembleConfig {
            min_producers: 1,
            ..EnsembleConfig::default()
        });
        assert_eq!(aggregator.required(), 2);
    }
}
