//! Circuit breaker to prevent cascade failures.
//!
//! Each endpoint gets its own breaker. Failures are counted in a rolling
//! window; once the threshold is reached the circuit opens and calls are
//! rejected without touching the endpoint. After `open_duration` a single
//! probe is admitted: success closes the circuit, failure reopens it.
//!
//! The breaker does not classify failures. Whoever holds a [`Permit`]
//! reports one outcome per guarded operation.

use parking_lot::{Mutex, RwLock};
use quorum_core::{BreakerSettings, BreakerTable, CallError, Endpoint};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::events::{EventBus, EventPayload};

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// All calls rejected without reaching the endpoint
    Open,

    /// One probe call admitted to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub endpoint: String,
    pub state: CircuitState,

    /// Failures currently inside the rolling window
    pub failures: usize,

    pub opened_at: Option<Instant>,

    /// Time until the next probe may be admitted, when not closed
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_started: Option<Instant>,
    probe_generation: u64,
}

/// Circuit breaker guarding exactly one endpoint.
pub struct CircuitBreaker {
    endpoint: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    events: Option<EventBus>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            endpoint: endpoint.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_started: None,
                probe_generation: 0,
            }),
            events: None,
        }
    }

    /// Emit a `circuit_state_changed` event on every transition.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Ask to make one guarded call.
    ///
    /// Fails with [`CallError::CircuitOpen`] while the circuit is open, or
    /// while it is half-open and the probe slot is taken.
    pub fn try_acquire(&self) -> Result<Permit<'_>, CallError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, None)),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed >= self.settings.open_duration {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    let generation = self.start_probe(&mut inner, now);
                    Ok(Permit::new(self, Some(generation)))
                } else {
                    Err(self.rejection(self.settings.open_duration - elapsed))
                }
            }
            CircuitState::HalfOpen => match inner.probe_started {
                Some(started) => {
                    let elapsed = now.saturating_duration_since(started);
                    if elapsed >= self.settings.probe_interval {
                        // The outstanding probe never reported back
                        tracing::debug!(endpoint = %self.endpoint, "Stale probe released");
                        let generation = self.start_probe(&mut inner, now);
                        Ok(Permit::new(self, Some(generation)))
                    } else {
                        Err(self.rejection(self.settings.probe_interval - elapsed))
                    }
                }
                None => {
                    let generation = self.start_probe(&mut inner, now);
                    Ok(Permit::new(self, Some(generation)))
                }
            },
        }
    }

    /// Run `call` under the breaker, recording its outcome.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T, CallError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let permit = self.try_acquire()?;
        match call().await {
            Ok(value) => {
                permit.record_success();
                Ok(value)
            }
            Err(e) => {
                permit.record_failure();
                Err(e)
            }
        }
    }

    /// Stored state. An open circuit whose `open_duration` has passed still
    /// reports `Open` until the next call is admitted as a probe.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.prune(&mut inner, now);

        let retry_in = match inner.state {
            CircuitState::Closed => None,
            CircuitState::Open => inner.opened_at.map(|at| {
                self.settings
                    .open_duration
                    .saturating_sub(now.saturating_duration_since(at))
            }),
            CircuitState::HalfOpen => Some(
                inner
                    .probe_started
                    .map(|at| {
                        self.settings
                            .probe_interval
                            .saturating_sub(now.saturating_duration_since(at))
                    })
                    .unwrap_or(Duration::ZERO),
            ),
        };

        BreakerSnapshot {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            failures: inner.failures.len(),
            opened_at: inner.opened_at,
            retry_in,
        }
    }

    /// Force the circuit closed and forget all failures.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_started = None;
        self.transition(&mut inner, CircuitState::Closed);
    }

    fn start_probe(&self, inner: &mut BreakerInner, now: Instant) -> u64 {
        inner.probe_generation += 1;
        inner.probe_started = Some(now);
        inner.probe_generation
    }

    fn rejection(&self, retry_in: Duration) -> CallError {
        CallError::CircuitOpen {
            endpoint: self.endpoint.clone(),
            retry_in,
        }
    }

    fn prune(&self, inner: &mut BreakerInner, now: Instant) {
        let window = self.settings.failure_window;
        while let Some(&oldest) = inner.failures.front() {
            if now.saturating_duration_since(oldest) > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn on_success(&self, probe: Option<u64>) {
        let mut inner = self.inner.lock();
        match (inner.state, probe) {
            (CircuitState::Closed, _) => inner.failures.clear(),
            (CircuitState::HalfOpen, Some(generation)) if generation == inner.probe_generation => {
                inner.failures.clear();
                inner.opened_at = None;
                inner.probe_started = None;
                self.transition(&mut inner, CircuitState::Closed);
                tracing::info!(endpoint = %self.endpoint, "Circuit closed after successful probe");
            }
            // Stale outcomes from calls admitted before the circuit opened
            _ => {}
        }
    }

    fn on_failure(&self, probe: Option<u64>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match (inner.state, probe) {
            (CircuitState::Closed, _) => {
                inner.failures.push_back(now);
                self.prune(&mut inner, now);
                let failures = inner.failures.len();
                if failures >= self.settings.failure_threshold as usize {
                    inner.failures.clear();
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, CircuitState::Open);
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        failures,
                        open_for = ?self.settings.open_duration,
                        "Circuit opened after repeated failures"
                    );
                }
            }
            (CircuitState::HalfOpen, Some(generation)) if generation == inner.probe_generation => {
                inner.opened_at = Some(now);
                inner.probe_started = None;
                self.transition(&mut inner, CircuitState::Open);
                tracing::warn!(endpoint = %self.endpoint, "Circuit reopened after failed probe");
            }
            _ => {}
        }
    }

    fn on_abandoned(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_generation == generation {
            inner.probe_started = None;
            tracing::debug!(endpoint = %self.endpoint, "Probe abandoned, slot released");
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::debug!(endpoint = %self.endpoint, %from, %to, "Circuit state changed");

        if let Some(events) = &self.events {
            events.publish(
                "breaker",
                None,
                EventPayload::CircuitStateChanged {
                    endpoint: self.endpoint.clone(),
                    from,
                    to,
                },
            );
        }
    }
}

/// Admission for one guarded call.
///
/// Report the outcome with [`record_success`](Self::record_success) or
/// [`record_failure`](Self::record_failure). Dropping an unreported probe
/// permit frees the half-open slot for another caller.
#[must_use = "report the call outcome through the permit"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
    reported: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: Option<u64>) -> Self {
        Self {
            breaker,
            probe,
            reported: false,
        }
    }

    /// Whether this permit is the half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            if let Some(generation) = self.probe {
                self.breaker.on_abandoned(generation);
            }
        }
    }
}

/// Hands out one shared breaker per endpoint id.
pub struct BreakerRegistry {
    table: BreakerTable,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: Option<EventBus>,
}

impl BreakerRegistry {
    pub fn new(table: BreakerTable) -> Self {
        Self {
            table,
            breakers: RwLock::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Breaker for an endpoint, created from its category's settings on
    /// first use.
    pub fn for_endpoint(&self, endpoint: &Endpoint) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(&endpoint.id) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(endpoint.id.clone()).or_insert_with(|| {
            let settings = self.table.for_category(endpoint.category).clone();
            let mut breaker = CircuitBreaker::new(endpoint.id.clone(), settings);
            if let Some(events) = &self.events {
                breaker = breaker.with_events(events.clone());
            }
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    pub fn get(&self, endpoint_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(endpoint_id).cloned()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshots
    }

    /// Reset all circuits to closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerTable::default())
    }
}
