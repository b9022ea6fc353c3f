//! Caching of ensemble results.
//!
//! Identical requests fanned out to the same producer set within the TTL
//! are answered from memory instead of calling every producer again.

use moka::future::Cache;
use quorum_core::{EnsembleConfig, EnsembleResult, WorkUnit};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Cache key: the request payload and the producer set it was sent to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EnsembleKey {
    payload_hash: u64,
    producers: Vec<String>,
}

impl EnsembleKey {
    /// Producer order does not matter.
    pub fn new<'a>(unit: &WorkUnit, producer_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let mut producers: Vec<String> = producer_ids.into_iter().map(str::to_string).collect();
        producers.sort();
        producers.dedup();

        Self {
            payload_hash: hash_payload(&unit.payload),
            producers,
        }
    }
}

fn hash_payload(payload: &serde_json::Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    // Object keys serialize in sorted order, so equal payloads hash equally
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Ensemble result cache using moka.
pub struct EnsembleCache {
    cache: Cache<EnsembleKey, EnsembleResult>,
}

impl EnsembleCache {
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// Cache sized from config; `None` when `cache_capacity` is 0.
    pub fn from_config(config: &EnsembleConfig) -> Option<Self> {
        (config.cache_capacity > 0).then(|| Self::new(config.cache_capacity, config.cache_ttl))
    }

    pub async fn get(&self, key: &EnsembleKey) -> Option<EnsembleResult> {
        self.cache.get(key).await
    }

    pub async fn insert(&self, key: EnsembleKey, result: EnsembleResult) {
        self.cache.insert(key, result).await;
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for EnsembleCache {
    fn default() -> Self {
        Self::new(10_000, Duration::from_secs(3600))
    }
}
