//! Rotation over a pool of interchangeable low-cost endpoints.
//!
//! Endpoints that hit a rate limit are excluded for a while and skipped by
//! the round-robin cursor. Exclusions lapse on their own once their expiry
//! passes.

use chrono::Utc;
use parking_lot::Mutex;
use quorum_core::{Endpoint, ExhaustionPolicy, QuorumConfig, RotationConfig};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::QuorumError;
use crate::events::{EventBus, EventPayload};

/// Longest an endpoint stays excluded, whatever a provider hint asks for.
pub const MAX_EXCLUSION: Duration = Duration::from_secs(24 * 60 * 60);

/// Rotation state: pool order, timed exclusions, and the cursor.
#[derive(Debug, Clone)]
pub struct RotationRegistry {
    endpoints: Vec<Endpoint>,
    excluded: HashMap<String, Instant>,
    cursor: usize,
}

impl RotationRegistry {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            excluded: HashMap::new(),
            cursor: 0,
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        self.excluded.retain(|_, until| *until > now);
    }

    /// Pick the next healthy endpoint.
    ///
    /// Healthy endpoints matching `affinity` are preferred when any exist.
    /// The cursor advances on every selection, so repeated calls cycle
    /// through the candidates instead of returning the first one.
    pub fn select(&mut self, affinity: Option<&str>, now: Instant) -> Option<Endpoint> {
        self.prune(now);

        let excluded = &self.excluded;
        let healthy: Vec<&Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| !excluded.contains_key(&e.id))
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let preferred: Vec<&Endpoint> = match affinity {
            Some(affinity) => healthy
                .iter()
                .copied()
                .filter(|e| e.matches_affinity(affinity))
                .collect(),
            None => Vec::new(),
        };
        let candidates = if preferred.is_empty() { healthy } else { preferred };

        let chosen = candidates[self.cursor % candidates.len()].clone();
        self.cursor = self.cursor.wrapping_add(1);
        Some(chosen)
    }

    /// Exclude an endpoint until `until`. A later existing expiry is kept.
    ///
    /// Returns false if the id is not in the pool.
    pub fn exclude(&mut self, endpoint_id: &str, until: Instant) -> bool {
        if !self.endpoints.iter().any(|e| e.id == endpoint_id) {
            return false;
        }
        let expiry = self.excluded.entry(endpoint_id.to_string()).or_insert(until);
        if until > *expiry {
            *expiry = until;
        }
        true
    }

    pub fn is_excluded(&self, endpoint_id: &str, now: Instant) -> bool {
        self.excluded
            .get(endpoint_id)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    /// Endpoints not excluded at `now`.
    pub fn healthy_count(&self, now: Instant) -> usize {
        self.endpoints
            .iter()
            .filter(|e| !self.is_excluded(&e.id, now))
            .count()
    }

    /// When the first live exclusion lapses.
    pub fn earliest_recovery(&self, now: Instant) -> Option<Instant> {
        self.excluded.values().copied().filter(|until| *until > now).min()
    }

    pub fn clear(&mut self) {
        self.excluded.clear();
    }
}

/// Thread-safe rotator over one [`RotationRegistry`].
///
/// Create one per pool and share it by reference (or `Arc`); every
/// mutation goes through its methods.
pub struct EndpointRotator {
    registry: Mutex<RotationRegistry>,
    exclusion: Duration,
    on_exhausted: ExhaustionPolicy,
    events: Option<EventBus>,
}

impl EndpointRotator {
    pub fn new(endpoints: Vec<Endpoint>, config: &RotationConfig) -> Self {
        Self {
            registry: Mutex::new(RotationRegistry::new(endpoints)),
            exclusion: config.exclusion,
            on_exhausted: config.on_exhausted.clone(),
            events: None,
        }
    }

    /// Rotator over the configured pool, in configured order.
    pub fn from_config(config: &QuorumConfig) -> Self {
        Self::new(config.rotation_endpoints(), &config.rotation)
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn pool(&self) -> Vec<Endpoint> {
        self.registry.lock().endpoints().to_vec()
    }

    pub fn pool_size(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn healthy_count(&self) -> usize {
        self.registry.lock().healthy_count(Instant::now())
    }

    pub fn is_excluded(&self, endpoint_id: &str) -> bool {
        self.registry.lock().is_excluded(endpoint_id, Instant::now())
    }

    /// Next endpoint to use, honouring the exhaustion policy when every
    /// endpoint is excluded.
    pub async fn next_endpoint(&self, affinity: Option<&str>) -> Result<Endpoint, QuorumError> {
        if let Some(endpoint) = self.select(affinity) {
            return Ok(endpoint);
        }
        if self.pool_size() == 0 {
            return Err(QuorumError::RotationExhausted("rotation pool is empty".to_string()));
        }

        match &self.on_exhausted {
            ExhaustionPolicy::Fail => {}
            ExhaustionPolicy::ClearAndRetry => {
                tracing::warn!("All pool endpoints excluded, clearing exclusions");
                self.clear();
                if let Some(endpoint) = self.select(affinity) {
                    return Ok(endpoint);
                }
            }
            ExhaustionPolicy::Wait { max_wait } => {
                let now = Instant::now();
                let recovery = self.registry.lock().earliest_recovery(now);
                if let Some(at) = recovery {
                    let wait = at.saturating_duration_since(now);
                    if wait <= *max_wait {
                        tracing::warn!(wait = ?wait, "All pool endpoints excluded, waiting");
                        tokio::time::sleep(wait).await;
                        self.clear();
                        if let Some(endpoint) = self.select(affinity) {
                            return Ok(endpoint);
                        }
                    }
                }
            }
        }

        Err(QuorumError::RotationExhausted(format!(
            "all {} pool endpoints are rate limited",
            self.pool_size()
        )))
    }

    fn select(&self, affinity: Option<&str>) -> Option<Endpoint> {
        self.registry.lock().select(affinity, Instant::now())
    }

    /// Exclude an endpoint until `until`, at most [`MAX_EXCLUSION`] from now.
    pub fn mark_unhealthy(&self, endpoint_id: &str, until: Instant) {
        let now = Instant::now();
        let until = until.min(now + MAX_EXCLUSION);
        let known = self.registry.lock().exclude(endpoint_id, until);
        if !known {
            tracing::debug!(endpoint = endpoint_id, "Ignoring exclusion for endpoint outside the pool");
            return;
        }

        let excluded_for = until.saturating_duration_since(now);
        tracing::info!(endpoint = endpoint_id, excluded_for = ?excluded_for, "Endpoint excluded from rotation");

        if let Some(events) = &self.events {
            let delta = chrono::Duration::from_std(excluded_for).unwrap_or_else(|_| chrono::Duration::zero());
            events.publish(
                "rotator",
                None,
                EventPayload::EndpointExcluded {
                    endpoint: endpoint_id.to_string(),
                    until: Utc::now() + delta,
                },
            );
        }
    }

    pub fn mark_unhealthy_for(&self, endpoint_id: &str, duration: Duration) {
        self.mark_unhealthy(endpoint_id, Instant::now() + duration.min(MAX_EXCLUSION));
    }

    /// Exclude after a rate limit, for the provider's hint if given,
    /// otherwise for the configured exclusion period.
    pub fn mark_rate_limited(&self, endpoint_id: &str, hint: Option<Duration>) {
        self.mark_unhealthy_for(endpoint_id, hint.unwrap_or(self.exclusion));
    }

    pub fn clear(&self) {
        self.registry.lock().clear();
    }
}
