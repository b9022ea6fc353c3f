//! Consensus: folds surviving producer results into one answer.
//!
//! The fan-in is deterministic and never calls out:
//! 1. `value` is the confidence-weighted average of contributor values
//! 2. Each contributor votes a direction (positive, negative, neutral);
//!    the majority is the direction with most votes, ties broken by the
//!    larger confidence sum and then in favour of neutral
//! 3. `agreement_ratio` is the share of contributors voting the majority
//! 4. `confidence` is the mean contributor confidence scaled by agreement

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{EnsembleResult, Exclusion, ProducerResult};

/// Direction a value points in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
    Neutral,
}

impl Direction {
    pub fn of(value: f64) -> Self {
        if value > 0.0 {
            Direction::Positive
        } else if value < 0.0 {
            Direction::Negative
        } else {
            Direction::Neutral
        }
    }
}

/// Outcome of a consensus computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus {
    pub value: f64,
    pub confidence: f64,
    pub agreement_ratio: f64,
    pub majority: Direction,
}

/// Computes consensus over producer results.
#[derive(Debug, Default)]
pub struct ConsensusEngine;

impl ConsensusEngine {
    pub fn new() -> Self {
        Self
    }

    /// Compute consensus over usable results.
    ///
    /// Returns `None` when no result is usable. Callers enforce their own
    /// minimum contributor count before presenting the answer.
    pub fn compute(&self, results: &[ProducerResult]) -> Option<Consensus> {
        let usable: Vec<&ProducerResult> = results.iter().filter(|r| r.is_usable()).collect();
        if usable.is_empty() {
            return None;
        }

        let count = usable.len() as f64;
        let weight: f64 = usable.iter().map(|r| r.confidence).sum();

        let value = if weight > 0.0 {
            usable.iter().map(|r| r.value * r.confidence).sum::<f64>() / weight
        } else {
            // No producer expressed any confidence; fall back to the plain mean
            usable.iter().map(|r| r.value).sum::<f64>() / count
        };

        let majority = self.majority_direction(&usable);
        let agreeing = usable
            .iter()
            .filter(|r| Direction::of(r.value) == majority)
            .count() as f64;
        let agreement_ratio = agreeing / count;

        let mean_confidence = weight / count;

        Some(Consensus {
            value,
            confidence: mean_confidence * agreement_ratio,
            agreement_ratio,
            majority,
        })
    }

    /// Build the immutable ensemble result from a computed consensus.
    pub fn into_result(
        &self,
        correlation_id: impl Into<String>,
        consensus: &Consensus,
        contributors: &[ProducerResult],
        excluded: Vec<Exclusion>,
    ) -> EnsembleResult {
        EnsembleResult {
            correlation_id: correlation_id.into(),
            consensus_value: consensus.value,
            consensus_confidence: consensus.confidence,
            agreement_ratio: consensus.agreement_ratio,
            contributing: contributors.iter().map(|r| r.producer_id.clone()).collect(),
            excluded,
            total_cost: contributors.iter().map(|r| r.cost_incurred).sum(),
            cached: false,
            completed_at: Utc::now(),
        }
    }

    fn majority_direction(&self, usable: &[&ProducerResult]) -> Direction {
        // Neutral listed first so it wins exact ties
        let tallies = [Direction::Neutral, Direction::Positive, Direction::Negative].map(|dir| {
            let members = usable.iter().filter(|r| Direction::of(r.value) == dir);
            let (votes, weight) = members.fold((0usize, 0.0f64), |(n, w), r| (n + 1, w + r.confidence));
            (dir, votes, weight)
        });

        let mut best = tallies[0];
        for candidate in &tallies[1..] {
            let better = candidate.1 > best.1 || (candidate.1 == best.1 && candidate.2 > best.2);
            if better {
                best = *candidate;
            }
        }
        best.0
    }
}
