//! Cost budget management for downstream calls.
//!
//! Amounts are held as integer micro-dollars so reservations can be made
//! with a single compare-and-swap. A budget never goes below zero: spend is
//! reserved before dispatch and settled against the actual cost after.

use parking_lot::RwLock;
use quorum_core::{BudgetConfig, WorkUnit};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::QuorumError;

const MICROS_PER_USD: f64 = 1_000_000.0;

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * MICROS_PER_USD).round() as u64
    } else {
        0
    }
}

fn to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Spend ceiling for one scope (a work unit or the whole session).
#[derive(Debug)]
pub struct CostBudget {
    max: u64,
    used: AtomicU64,
}

impl CostBudget {
    pub fn new(max_usd: f64) -> Self {
        Self {
            max: to_micros(max_usd),
            used: AtomicU64::new(0),
        }
    }

    /// Check if we can afford a call.
    pub fn can_afford(&self, usd: f64) -> bool {
        self.remaining_micros() >= to_micros(usd)
    }

    /// Claim `micros` if they fit. Never overshoots the ceiling.
    fn try_reserve(&self, micros: u64) -> bool {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.checked_add(micros)?;
                (next <= self.max).then_some(next)
            })
            .is_ok()
    }

    /// Give back part of an earlier reservation.
    fn release(&self, micros: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(micros))
            });
    }

    /// Charge as much of `micros` as still fits; returns what was charged.
    fn charge_up_to(&self, micros: u64) -> u64 {
        let mut charged = 0;
        let _ = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                charged = micros.min(self.max.saturating_sub(used));
                Some(used + charged)
            });
        charged
    }

    fn remaining_micros(&self) -> u64 {
        self.max.saturating_sub(self.used.load(Ordering::SeqCst))
    }

    pub fn remaining(&self) -> f64 {
        to_usd(self.remaining_micros())
    }

    pub fn used(&self) -> f64 {
        to_usd(self.used.load(Ordering::SeqCst))
    }

    pub fn max(&self) -> f64 {
        to_usd(self.max)
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::SeqCst);
    }
}

/// Accumulated spend for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendSummary {
    /// Calls settled
    pub calls: u32,

    /// Total cost in USD
    pub total_cost: f64,

    /// Cost per tier or endpoint label
    pub by_label: BTreeMap<String, f64>,

    /// Settlements where the actual cost exceeded what the budget could cover
    pub clipped: u32,
}

/// Spend claimed ahead of a call. Settle or refund it exactly once.
#[derive(Debug)]
#[must_use = "settle or refund the reservation"]
pub struct Reservation {
    unit: Option<Arc<CostBudget>>,
    micros: u64,
}

impl Reservation {
    pub fn amount(&self) -> f64 {
        to_usd(self.micros)
    }
}

/// Budget tracker for work units and the session.
pub struct CostBudgetTracker {
    session: CostBudget,
    units: RwLock<HashMap<String, Arc<CostBudget>>>,
    summary: RwLock<SpendSummary>,
}

impl CostBudgetTracker {
    pub fn new(session_max: f64) -> Self {
        Self {
            session: CostBudget::new(session_max),
            units: RwLock::new(HashMap::new()),
            summary: RwLock::new(SpendSummary::default()),
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(config.session_max)
    }

    /// Start tracking a work unit, seeded from its `cost_budget`.
    ///
    /// Opening an already-open unit keeps the existing budget. Returns
    /// whether this call opened it.
    pub fn open_unit(&self, unit: &WorkUnit) -> bool {
        let mut units = self.units.write();
        if units.contains_key(&unit.correlation_id) {
            return false;
        }
        units.insert(unit.correlation_id.clone(), Arc::new(CostBudget::new(unit.cost_budget)));
        true
    }

    /// Stop tracking a work unit; returns what it spent.
    pub fn close_unit(&self, correlation_id: &str) -> Option<f64> {
        self.units.write().remove(correlation_id).map(|b| b.used())
    }

    fn unit(&self, correlation_id: &str) -> Option<Arc<CostBudget>> {
        self.units.read().get(correlation_id).cloned()
    }

    /// What a call may still spend: the smaller of the unit's and the
    /// session's remaining budget.
    pub fn remaining_for(&self, correlation_id: &str) -> f64 {
        let session = self.session.remaining();
        match self.unit(correlation_id) {
            Some(unit) => unit.remaining().min(session),
            None => session,
        }
    }

    pub fn can_afford(&self, correlation_id: &str, cost: f64) -> bool {
        let unit_ok = self
            .unit(correlation_id)
            .map(|b| b.can_afford(cost))
            .unwrap_or(true);

        unit_ok && self.session.can_afford(cost)
    }

    /// Claim `cost` from both the unit and the session, or neither.
    pub fn try_reserve(&self, correlation_id: &str, cost: f64) -> Result<Reservation, QuorumError> {
        let micros = to_micros(cost);
        let unit = self.unit(correlation_id);

        if let Some(budget) = &unit {
            if !budget.try_reserve(micros) {
                return Err(self.exceeded(correlation_id, cost));
            }
        }

        if !self.session.try_reserve(micros) {
            if let Some(budget) = &unit {
                budget.release(micros);
            }
            return Err(self.exceeded(correlation_id, cost));
        }

        Ok(Reservation { unit, micros })
    }

    /// Replace a reservation with the actual cost of the call.
    ///
    /// Unused reservation is refunded. Any excess is charged only as far as
    /// the budgets still reach, so neither scope can go negative.
    pub fn settle(&self, reservation: Reservation, actual: f64, label: &str) {
        let actual_micros = to_micros(actual);
        let reserved = reservation.micros;
        let mut charged = actual_micros;

        if actual_micros <= reserved {
            let refund = reserved - actual_micros;
            self.session.release(refund);
            if let Some(unit) = &reservation.unit {
                unit.release(refund);
            }
        } else {
            let excess = actual_micros - reserved;
            let mut covered = self.session.charge_up_to(excess);
            if let Some(unit) = &reservation.unit {
                let unit_covered = unit.charge_up_to(covered);
                if unit_covered < covered {
                    self.session.release(covered - unit_covered);
                    covered = unit_covered;
                }
            }
            charged = reserved + covered;
            if covered < excess {
                tracing::warn!(
                    label,
                    actual,
                    charged = to_usd(charged),
                    "Actual cost exceeded remaining budget, charge clipped"
                );
            }
        }

        let mut summary = self.summary.write();
        summary.calls += 1;
        summary.total_cost += to_usd(charged);
        *summary.by_label.entry(label.to_string()).or_insert(0.0) += to_usd(charged);
        if charged < actual_micros {
            summary.clipped += 1;
        }
    }

    /// Return a reservation unused (the call failed before incurring cost).
    pub fn refund(&self, reservation: Reservation) {
        self.session.release(reservation.micros);
        if let Some(unit) = &reservation.unit {
            unit.release(reservation.micros);
        }
    }

    pub fn session_remaining(&self) -> f64 {
        self.session.remaining()
    }

    pub fn summary(&self) -> SpendSummary {
        self.summary.read().clone()
    }

    /// Reset all budgets.
    pub fn reset(&self) {
        self.session.reset();
        self.units.write().clear();
        *self.summary.write() = SpendSummary::default();
    }

    fn exceeded(&self, correlation_id: &str, requested: f64) -> QuorumError {
        QuorumError::BudgetExceeded {
            requested,
            remaining: self.remaining_for(correlation_id),
        }
    }
}

impl Default for CostBudgetTracker {
    fn default() -> Self {
        Self::from_config(&BudgetConfig::default())
    }
}
