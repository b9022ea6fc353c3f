//! Client seams for the three dependency families and their producer
//! adapters.
//!
//! Implement [`SourceClient`], [`ModelClient`] or [`VenueClient`] for a
//! concrete integration; wrap it in the matching adapter to make it a
//! [`Producer`].

use async_trait::async_trait;
use quorum_core::{CallError, Endpoint, ExecutionResult, ProducerResult, WorkUnit};
use std::sync::Arc;
use tokio::time::Instant;

use super::Producer;

/// A searchable intelligence source.
#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn call(&self, query: &str) -> Result<ProducerResult, CallError>;
}

/// A forecasting model. Receives the endpoint so one client can serve
/// several models (a rotation pool behind one provider).
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(&self, model: &Endpoint, features: &serde_json::Value) -> Result<ProducerResult, CallError>;
}

/// A trading venue.
#[async_trait]
pub trait VenueClient: Send + Sync {
    async fn call(&self, order: &serde_json::Value) -> Result<ExecutionResult, CallError>;
}

/// Stamp the measured latency when the client did not report one.
fn with_measured_latency(mut result: ProducerResult, started: Instant) -> ProducerResult {
    if result.latency.is_zero() {
        result.latency = started.elapsed();
    }
    result
}

/// Adapts a [`SourceClient`]: the unit's payload becomes the query text.
pub struct SourceProducer {
    endpoint: Endpoint,
    client: Arc<dyn SourceClient>,
}

impl SourceProducer {
    pub fn new(endpoint: Endpoint, client: Arc<dyn SourceClient>) -> Self {
        Self { endpoint, client }
    }
}

#[async_trait]
impl Producer for SourceProducer {
    type Output = ProducerResult;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn call(&self, unit: &WorkUnit) -> Result<ProducerResult, CallError> {
        let query = unit.query_text();
        if query.trim().is_empty() {
            return Err(CallError::Validation(format!(
                "{}: empty query",
                self.endpoint.id
            )));
        }
        let started = Instant::now();
        let result = self.client.call(&query).await?;
        Ok(with_measured_latency(result, started))
    }
}

/// Adapts a [`ModelClient`]: the unit's payload is the feature set.
pub struct ModelProducer {
    endpoint: Endpoint,
    client: Arc<dyn ModelClient>,
}

impl ModelProducer {
    pub fn new(endpoint: Endpoint, client: Arc<dyn ModelClient>) -> Self {
        Self { endpoint, client }
    }
}

#[async_trait]
impl Producer for ModelProducer {
    type Output = ProducerResult;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn call(&self, unit: &WorkUnit) -> Result<ProducerResult, CallError> {
        if unit.payload.is_null() {
            return Err(CallError::Validation(format!(
                "{}: no features supplied",
                self.endpoint.id
            )));
        }
        let started = Instant::now();
        let result = self.client.call(&self.endpoint, &unit.payload).await?;
        Ok(with_measured_latency(result, started))
    }
}

/// Adapts a [`VenueClient`]: the unit's payload is the order.
///
/// A venue that answers but does not accept the order is reported as a
/// rejected execution.
pub struct VenueProducer {
    endpoint: Endpoint,
    client: Arc<dyn VenueClient>,
}

impl VenueProducer {
    pub fn new(endpoint: Endpoint, client: Arc<dyn VenueClient>) -> Self {
        Self { endpoint, client }
    }
}

#[async_trait]
impl Producer for VenueProducer {
    type Output = ExecutionResult;

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn call(&self, unit: &WorkUnit) -> Result<ExecutionResult, CallError> {
        if !unit.payload.is_object() {
            return Err(CallError::Validation(format!(
                "{}: order must be an object",
                self.endpoint.id
            )));
        }
        let started = Instant::now();
        let mut result = self.client.call(&unit.payload).await?;
        if !result.accepted {
            return Err(CallError::execution(
                &self.endpoint.id,
                format!("order {} not accepted", result.order_id),
                false,
            ));
        }
        if result.latency.is_zero() {
            result.latency = started.elapsed();
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::EndpointCategory;
    use serde_json::json;
    use std::time::Duration;

    struct EchoSource;

    #[async_trait]
    impl SourceClient for EchoSource {
        async fn call(&self, query: &str) -> Result<ProducerResult, CallError> {
            Ok(ProducerResult::new("exa", query.len() as f64, 0.9))
        }
    }

    struct FixedModel;

    #[async_trait]
    impl ModelClient for FixedModel {
        async fn call(&self, model: &Endpoint, features: &serde_json::Value) -> Result<ProducerResult, CallError> {
            let momentum = features["momentum"].as_f64().unwrap_or(0.0);
            Ok(ProducerResult::new(&model.id, momentum, 0.6).with_cost(model.cost_per_call))
        }
    }

    struct Venue {
        accept: bool,
    }

    #[async_trait]
    impl VenueClient for Venue {
        async fn call(&self, _order: &serde_json::Value) -> Result<ExecutionResult, CallError> {
            Ok(ExecutionResult {
                order_id: "o-1".into(),
                accepted: self.accept,
                filled_value: 100.0,
                cost_incurred: 0.02,
                latency: Duration::from_millis(40),
            })
        }
    }

    fn unit(payload: serde_json::Value) -> WorkUnit {
        WorkUnit::new("c1", payload, 1.0, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_source_receives_query_text() {
        let producer = SourceProducer::new(
            Endpoint::new("exa", EndpointCategory::IntelligenceSource),
            Arc::new(EchoSource),
        );
        let result = producer.call(&unit(json!({"query": "fed"}))).await.unwrap();
        assert_eq!(result.value, 3.0);

        let empty = producer.call(&unit(json!(""))).await;
        assert!(matches!(empty, Err(CallError::Validation(_))));
    }

    #[tokio::test]
    async fn test_model_receives_endpoint_and_features() {
        let producer = ModelProducer::new(
            Endpoint::new("lstm", EndpointCategory::ForecastingModel).with_cost(0.01),
            Arc::new(FixedModel),
        );
        let result = producer.call(&unit(json!({"momentum": -0.4}))).await.unwrap();
        assert_eq!(result.producer_id, "lstm");
        assert_eq!(result.value, -0.4);
        assert_eq!(result.cost_incurred, 0.01);

        let missing = producer.call(&unit(serde_json::Value::Null)).await;
        assert!(matches!(missing, Err(CallError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unaccepted_order_is_rejected_execution() {
        let venue = Endpoint::new("kalshi", EndpointCategory::TradingVenue);
        let order = json!({"side": "buy", "qty": 10});

        let filled = VenueProducer::new(venue.clone(), Arc::new(Venue { accept: true }))
            .call(&unit(order.clone()))
            .await
            .unwrap();
        assert_eq!(filled.order_id, "o-1");

        let rejected = VenueProducer::new(venue, Arc::new(Venue { accept: false }))
            .call(&unit(order))
            .await
            .unwrap_err();
        assert_eq!(rejected.kind(), quorum_core::ErrorKind::ExecutionRejected);
    }
}
