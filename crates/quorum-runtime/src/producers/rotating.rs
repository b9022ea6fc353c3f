use async_trait::async_trait;
use quorum_core::{CallError, Endpoint, EndpointCategory, ProducerResult, WorkUnit};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{call_guarded, ModelClient, Producer};
use crate::resilience::{BreakerRegistry, EndpointRotator, RetryExecutor};

/// A model producer served from a rotation pool.
///
/// Each call picks the next healthy pool endpoint. A rate limit or an open
/// circuit excludes that endpoint and moves on to the next one, at most
/// once around the pool. Other failures are returned as they are.
pub struct RotatingProducer {
    descriptor: Endpoint,
    client: Arc<dyn ModelClient>,
    rotator: Arc<EndpointRotator>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryExecutor,
    affinity: Option<String>,
}

impl RotatingProducer {
    pub fn new(
        id: impl Into<String>,
        client: Arc<dyn ModelClient>,
        rotator: Arc<EndpointRotator>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let descriptor = pool_descriptor(id.into(), &rotator.pool());
        Self {
            descriptor,
            client,
            rotator,
            breakers,
            retry: RetryExecutor::default().without_rate_limit_retry(),
            affinity: None,
        }
    }

    /// Retry table for calls to individual pool endpoints. Rate limits are
    /// never retried in place.
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry.without_rate_limit_retry();
        self
    }

    /// Prefer pool endpoints tagged with this affinity.
    pub fn with_affinity(mut self, affinity: impl Into<String>) -> Self {
        self.affinity = Some(affinity.into());
        self
    }

    pub fn rotator(&self) -> &Arc<EndpointRotator> {
        &self.rotator
    }
}

/// Worst-case figures across the pool, so tier and deadline checks stay
/// conservative whichever endpoint ends up serving the call.
fn pool_descriptor(id: String, pool: &[Endpoint]) -> Endpoint {
    let cost = pool.iter().map(|e| e.cost_per_call).fold(0.0, f64::max);
    let latency = pool
        .iter()
        .map(|e| e.expected_latency)
        .max()
        .unwrap_or(Duration::ZERO);

    let mut descriptor = Endpoint::new(id, EndpointCategory::RotationPool)
        .with_cost(cost)
        .with_expected_latency(latency);
    if let Some(timeout) = pool.iter().map(|e| e.call_timeout).max() {
        descriptor = descriptor.with_call_timeout(timeout);
    }
    descriptor
}

#[async_trait]
impl Producer for RotatingProducer {
    type Output = ProducerResult;

    fn endpoint(&self) -> &Endpoint {
        &self.descriptor
    }

    async fn call(&self, unit: &WorkUnit) -> Result<ProducerResult, CallError> {
        if unit.payload.is_null() {
            return Err(CallError::Validation(format!(
                "{}: no features supplied",
                self.descriptor.id
            )));
        }

        let passes = self.rotator.pool_size();
        for _ in 0..passes {
            let model = match self.rotator.next_endpoint(self.affinity.as_deref()).await {
                Ok(model) => model,
                Err(e) => {
                    tracing::warn!(pool = %self.descriptor.id, error = %e, "No pool endpoint available");
                    break;
                }
            };

            let breaker = self.breakers.for_endpoint(&model);
            let started = Instant::now();
            let outcome = call_guarded(&breaker, &self.retry, &model, || {
                self.client.call(&model, &unit.payload)
            })
            .await;

            match outcome {
                Ok(mut result) => {
                    if result.latency.is_zero() {
                        result.latency = started.elapsed();
                    }
                    return Ok(result);
                }
                Err(CallError::CircuitOpen { retry_in, .. }) => {
                    tracing::debug!(pool = %self.descriptor.id, endpoint = %model.id, "Circuit open, rotating");
                    self.rotator.mark_unhealthy_for(&model.id, retry_in);
                }
                Err(e) if e.triggers_rotation() => {
                    tracing::debug!(pool = %self.descriptor.id, endpoint = %model.id, "Rate limited, rotating");
                    self.rotator.mark_rate_limited(&model.id, e.retry_after());
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(pool = %self.descriptor.id, "Rotation pool exhausted");
        Err(CallError::rate_limited(&self.descriptor.id, None))
    }
}
