//! Folds an outcome's quality signals and its cost/latency penalties into one
//! signed scalar with a per-component breakdown.

use routewise_core::config::RewardConfig;
use routewise_core::{Outcome, RewardBreakdown};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const COST_COMPONENT: &str = "cost";
pub const LATENCY_COMPONENT: &str = "latency";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardWeights {
    /// Weight per quality signal name. Signals without a weight are ignored.
    pub signals: BTreeMap<String, f64>,
    /// Penalty per USD.
    pub cost: f64,
    /// Penalty per millisecond.
    pub latency: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self::from(&RewardConfig::default())
    }
}

impl From<&RewardConfig> for RewardWeights {
    fn from(config: &RewardConfig) -> Self {
        Self {
            signals: config
                .signal_weights
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            cost: config.cost_weight,
            latency: config.latency_weight,
        }
    }
}

/// Per-call weight overrides; each field replaces only its own default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightOverrides {
    #[serde(default)]
    pub signals: BTreeMap<String, f64>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub latency: Option<f64>,
}

impl RewardWeights {
    pub fn merged(&self, overrides: &WeightOverrides) -> RewardWeights {
        let mut merged = self.clone();
        for (name, weight) in &overrides.signals {
            merged.signals.insert(name.clone(), *weight);
        }
        if let Some(cost) = overrides.cost {
            merged.cost = cost;
        }
        if let Some(latency) = overrides.latency {
            merged.latency = latency;
        }
        merged
    }
}

pub struct RewardEngine {
    defaults: RewardWeights,
}

impl RewardEngine {
    pub fn new(defaults: RewardWeights) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &RewardWeights {
        &self.defaults
    }

    /// `total = Σ wᵢ·signalᵢ − w_cost·cost_usd − w_latency·latency_ms`.
    pub fn compute_reward(&self, outcome: &Outcome, overrides: Option<&WeightOverrides>) -> RewardBreakdown {
        let merged;
        let weights = match overrides {
            Some(o) => {
                merged = self.defaults.merged(o);
                &merged
            }
            None => &self.defaults,
        };

        let mut breakdown = RewardBreakdown::default();
        for (name, value) in &outcome.signals {
            if !value.is_finite() {
                warn!(signal = %name, value, "ignoring non-finite quality signal");
                continue;
            }
            match weights.signals.get(name) {
                Some(weight) => {
                    let contribution = weight * value;
                    breakdown.components.insert(name.clone(), contribution);
                    breakdown.total += contribution;
                }
                None => debug!(signal = %name, "no weight configured for signal"),
            }
        }

        let cost = finite_or_zero(COST_COMPONENT, outcome.cost_usd);
        let cost_penalty = -(weights.cost * cost);
        breakdown.components.insert(COST_COMPONENT.to_string(), cost_penalty);
        breakdown.total += cost_penalty;

        let latency = finite_or_zero(LATENCY_COMPONENT, outcome.latency_ms);
        let latency_penalty = -(weights.latency * latency);
        breakdown
            .components
            .insert(LATENCY_COMPONENT.to_string(), latency_penalty);
        breakdown.total += latency_penalty;

        breakdown
    }

    /// Split `breakdown.total` equally across distinct contributors.
    ///
    /// Equal split is a deliberate simplification; proportional attribution
    /// (by cost, latency or causal share) is not implemented.
    pub fn attribute_reward(&self, contributors: &[String], breakdown: &RewardBreakdown) -> BTreeMap<String, f64> {
        let mut shares: BTreeMap<String, f64> = contributors
            .iter()
            .map(|name| (name.clone(), 0.0))
            .collect();
        if shares.is_empty() {
            return shares;
        }
        let share = breakdown.total / shares.len() as f64;
        for value in shares.values_mut() {
            *value = share;
        }
        shares
    }
}

impl Default for RewardEngine {
    fn default() -> Self {
        Self::new(RewardWeights::default())
    }
}

fn finite_or_zero(component: &str, value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        warn!(component, value, "treating non-finite outcome field as zero");
        0.0
    }
}
