//! The uniform call capability shared by tiers and ensemble members.
//!
//! [`TierRouter`](crate::TierRouter) and
//! [`EnsembleAggregator`](crate::EnsembleAggregator) depend only on
//! [`Producer`]; concrete sources, models and venues are adapted to it in
//! [`clients`].

use async_trait::async_trait;
use quorum_core::{CallError, Endpoint, ExecutionResult, ProducerResult, WorkUnit};
use std::future::Future;
use std::sync::Arc;

use crate::resilience::{BreakerRegistry, CircuitBreaker, RetryExecutor};

pub mod clients;
mod rotating;

pub use clients::{
    ModelClient, ModelProducer, SourceClient, SourceProducer, VenueClient, VenueProducer,
};
pub use rotating::RotatingProducer;

/// Anything a producer returns: carries the actual cost of the call.
pub trait Outcome: Clone + Send + Sync + 'static {
    fn cost_incurred(&self) -> f64;
}

impl Outcome for ProducerResult {
    fn cost_incurred(&self) -> f64 {
        self.cost_incurred
    }
}

impl Outcome for ExecutionResult {
    fn cost_incurred(&self) -> f64 {
        self.cost_incurred
    }
}

/// One callable downstream path.
#[async_trait]
pub trait Producer: Send + Sync {
    type Output: Outcome;

    /// Endpoint this producer calls, used for cost and latency estimates.
    fn endpoint(&self) -> &Endpoint;

    /// Identifier reported in results and exclusions.
    fn id(&self) -> &str {
        &self.endpoint().id
    }

    async fn call(&self, unit: &WorkUnit) -> Result<Self::Output, CallError>;
}

/// Shared handle to a producer.
pub type DynProducer<O = ProducerResult> = Arc<dyn Producer<Output = O>>;

/// Run `call` behind a breaker, retrying per error kind and bounding each
/// attempt by the endpoint's `call_timeout`.
///
/// The breaker sees one outcome for the whole retry sequence. Validation
/// failures are the caller's fault and are not reported against the
/// endpoint.
pub(crate) async fn call_guarded<T, F, Fut>(
    breaker: &CircuitBreaker,
    retry: &RetryExecutor,
    endpoint: &Endpoint,
    mut call: F,
) -> Result<T, CallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let permit = breaker.try_acquire()?;
    let timeout = endpoint.call_timeout;

    let outcome = retry
        .execute_with_retry(&endpoint.id, |_| {
            let attempt = call();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(CallError::Timeout {
                        endpoint: endpoint.id.clone(),
                        after: timeout,
                    }),
                }
            }
        })
        .await;

    match &outcome {
        Ok(_) => permit.record_success(),
        Err(CallError::Validation(_)) => drop(permit),
        Err(_) => permit.record_failure(),
    }
    outcome
}

/// A producer wrapped in its endpoint's circuit breaker, the retry table,
/// and a per-attempt timeout.
pub struct GuardedProducer<P> {
    inner: P,
    breaker: Arc<CircuitBreaker>,
    retry: RetryExecutor,
}

impl<P: Producer> GuardedProducer<P> {
    pub fn new(inner: P, breaker: Arc<CircuitBreaker>, retry: RetryExecutor) -> Self {
        Self {
            inner,
            breaker,
            retry,
        }
    }

    /// Guard `inner` with the registry's shared breaker for its endpoint.
    pub fn from_registry(inner: P, registry: &BreakerRegistry, retry: RetryExecutor) -> Self {
        let breaker = registry.for_endpoint(inner.endpoint());
        Self::new(inner, breaker, retry)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn into_dyn(self) -> DynProducer<P::Output>
    where
        P: 'static,
    {
        Arc::new(self)
    }
}

#[async_trait]
impl<P: Producer> Producer for GuardedProducer<P> {
    type Output = P::Output;

    fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn call(&self, unit: &WorkUnit) -> Result<Self::Output, CallError> {
        call_guarded(&self.breaker, &self.retry, self.inner.endpoint(), || {
            self.inner.call(unit)
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProducer;
    use super::*;
    use quorum_core::{BreakerSettings, EndpointCategory};
    use crate::resilience::CircuitState;
    use std::time::Duration;

    fn unit() -> WorkUnit {
        WorkUnit::new("c1", serde_json::json!({"query": "q"}), 1.0, Duration::from_secs(30))
    }

    fn model(id: &str) -> Endpoint {
        Endpoint::new(id, EndpointCategory::ForecastingModel).with_call_timeout(Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_sees_one_failure_per_exhausted_call() {
        let scripted = Arc::new(ScriptedProducer::failing(
            model("m1"),
            CallError::inference("m1", "nan", true),
        ));
        let breaker = Arc::new(CircuitBreaker::new("m1", BreakerSettings::forecasting_model()));
        let guarded = GuardedProducer::new(Arc::clone(&scripted), Arc::clone(&breaker), RetryExecutor::default());

        assert!(guarded.call(&unit()).await.is_err());
        // inference_transient allows two attempts, reported as one failure
        assert_eq!(scripted.call_count(), 2);
        assert_eq!(breaker.snapshot().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_short_circuits() {
        let scripted = Arc::new(ScriptedProducer::failing(
            model("m1"),
            CallError::inference("m1", "bad weights", false),
        ));
        let guarded = GuardedProducer::new(
            Arc::clone(&scripted),
            Arc::new(CircuitBreaker::new("m1", BreakerSettings::forecasting_model())),
            RetryExecutor::default(),
        );

        for _ in 0..3 {
            let _ = guarded.call(&unit()).await;
        }
        assert_eq!(guarded.breaker().state(), CircuitState::Open);

        let result = guarded.call(&unit()).await;
        assert!(matches!(result, Err(CallError::CircuitOpen { .. })));
        assert_eq!(scripted.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let scripted = Arc::new(
            ScriptedProducer::ok(model("slow"), 0.5, 0.5).with_delay(Duration::from_secs(5)),
        );
        let guarded = GuardedProducer::new(
            Arc::clone(&scripted),
            Arc::new(CircuitBreaker::new("slow", BreakerSettings::forecasting_model())),
            RetryExecutor::default(),
        );

        let result = guarded.call(&unit()).await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));
        // transient policy: three attempts
        assert_eq!(scripted.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_does_not_count_against_endpoint() {
        let scripted = Arc::new(ScriptedProducer::failing(
            model("m1"),
            CallError::Validation("missing features".into()),
        ));
        let guarded = GuardedProducer::new(
            Arc::clone(&scripted),
            Arc::new(CircuitBreaker::new("m1", BreakerSettings::forecasting_model())),
            RetryExecutor::default(),
        );

        for _ in 0..5 {
            assert!(matches!(guarded.call(&unit()).await, Err(CallError::Validation(_))));
        }
        assert_eq!(guarded.breaker().state(), CircuitState::Closed);
        assert_eq!(scripted.call_count(), 5);
    }
}
