//! Structured events for completed work and state transitions.
//!
//! Delivery is at-least-once: the bus itself never duplicates, but
//! consumers that persist or forward events may redeliver them, so
//! [`EventDeduplicator`] is provided for consumers keyed on `event_id`.
//! Ordering holds only among events sharing a correlation id.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use quorum_core::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::resilience::CircuitState;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Type-specific event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    WorkUnitCompleted {
        tier: String,
        cost: f64,
        fallbacks: usize,
        latency_ms: u64,
    },

    WorkUnitFailed {
        reason: String,
    },

    TierFallback {
        tier: String,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },

    EnsembleCompleted {
        consensus_value: f64,
        consensus_confidence: f64,
        agreement_ratio: f64,
        contributing: Vec<String>,
        excluded: Vec<String>,
        cached: bool,
    },

    EnsembleFailed {
        succeeded: usize,
        required: usize,
        excluded: Vec<String>,
    },

    CircuitStateChanged {
        endpoint: String,
        from: CircuitState,
        to: CircuitState,
    },

    EndpointExcluded {
        endpoint: String,
        until: DateTime<Utc>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::WorkUnitCompleted { .. } => "work_unit_completed",
            EventPayload::WorkUnitFailed { .. } => "work_unit_failed",
            EventPayload::TierFallback { .. } => "tier_fallback",
            EventPayload::EnsembleCompleted { .. } => "ensemble_completed",
            EventPayload::EnsembleFailed { .. } => "ensemble_failed",
            EventPayload::CircuitStateChanged { .. } => "circuit_state_changed",
            EventPayload::EndpointExcluded { .. } => "endpoint_excluded",
        }
    }
}

/// Envelope shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,

    /// Request this event belongs to; absent for endpoint-level events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    pub timestamp: DateTime<Utc>,

    /// Emitting component (e.g., "router", "breaker")
    pub source: String,

    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, correlation_id: Option<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id,
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Fan-out event bus.
///
/// Emission never blocks and never fails the caller. Cloning the bus
/// yields another handle to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Emit an already-built event.
    pub fn emit(&self, event: Event) -> Uuid {
        let event_id = event.event_id;
        tracing::debug!(
            event_type = event.event_type(),
            event_id = %event_id,
            correlation_id = ?event.correlation_id,
            "Event emitted"
        );
        // No subscribers is not an error
        let _ = self.sender.send(event);
        event_id
    }

    /// Build and emit an event.
    pub fn publish(
        &self,
        source: &str,
        correlation_id: Option<&str>,
        payload: EventPayload,
    ) -> Uuid {
        self.emit(Event::new(source, correlation_id.map(str::to_string), payload))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving end of an [`EventBus`].
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Next event, or `None` once every bus handle has been dropped.
    ///
    /// A subscriber that falls behind loses the oldest events; the loss is
    /// logged and reception continues.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Remembers recently seen event ids so redelivered events can be skipped.
pub struct EventDeduplicator {
    seen: Cache<Uuid, ()>,
}

impl EventDeduplicator {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let seen = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { seen }
    }

    /// Returns true the first time an event id is observed.
    pub async fn first_delivery(&self, event: &Event) -> bool {
        self.seen.entry(event.event_id).or_insert(()).await.is_fresh()
    }
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(reason: &str) -> EventPayload {
        EventPayload::WorkUnitFailed {
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        bus.publish("router", Some("c1"), failed("first"));
        bus.publish("router", Some("c1"), failed("second"));

        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(first.payload, failed("first"));
        assert_eq!(second.payload, failed("second"));
        assert_eq!(first.correlation_id.as_deref(), Some("c1"));
        assert_ne!(first.event_id, second.event_id);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish("router", None, failed("nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.publish("router", None, failed(&format!("e{}", i)));
        }

        // Oldest events were overwritten; the newest two remain
        assert_eq!(sub.next().await.unwrap().payload, failed("e3"));
        assert_eq!(sub.next().await.unwrap().payload, failed("e4"));
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn test_deduplicator() {
        let dedup = EventDeduplicator::default();
        let event = Event::new("aggregator", Some("c9".into()), failed("x"));

        assert!(dedup.first_delivery(&event).await);
        assert!(!dedup.first_delivery(&event.clone()).await);

        let other = Event::new("aggregator", Some("c9".into()), failed("x"));
        assert!(dedup.first_delivery(&other).await);
    }

    #[test]
    fn test_payload_wire_format() {
        let event = Event::new(
            "breaker",
            None,
            EventPayload::CircuitStateChanged {
                endpoint: "exa".into(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            },
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["payload"]["type"], "circuit_state_changed");
        assert_eq!(json["payload"]["to"], "open");
        assert!(json.get("correlation_id").is_none());
        assert_eq!(event.event_type(), "circuit_state_changed");
    }
}
