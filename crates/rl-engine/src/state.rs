//! Per-arm learning state shared by every policy family.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Pull count and running-average reward for one arm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmState {
    pub count: u64,
    pub q: f64,
}

impl ArmState {
    /// Incremental running average: `q ← q + (reward − q) / (count + 1)`.
    pub fn observe(&mut self, reward: f64) {
        self.q += (reward - self.q) / (self.count + 1) as f64;
        self.count += 1;
    }
}

/// Arm id → state for a single domain.
pub type PolicyState = BTreeMap<String, ArmState>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("no candidates supplied")]
    NoCandidates,

    #[error("reward {0} is not finite")]
    NonFiniteReward(f64),

    #[error("context feature '{0}' is not finite")]
    NonFiniteContext(String),

    #[error("score for arm '{0}' is not finite")]
    NonFiniteScore(String),

    #[error("snapshot holds a {found} policy but the domain runs {expected}")]
    KindMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid snapshot state: {0}")]
    InvalidState(String),
}

pub(crate) fn check_reward(reward: f64) -> Result<(), PolicyError> {
    if reward.is_finite() {
        Ok(())
    } else {
        Err(PolicyError::NonFiniteReward(reward))
    }
}

/// First candidate with the strictly highest score; earlier candidates win ties.
pub(crate) fn argmax<'a>(
    candidates: &'a [String],
    mut score: impl FnMut(&str) -> f64,
) -> Result<&'a String, PolicyError> {
    let mut best: Option<(&String, f64)> = None;
    for arm in candidates {
        let s = score(arm);
        if s.is_nan() {
            return Err(PolicyError::NonFiniteScore(arm.clone()));
        }
        match best {
            Some((_, current)) if s <= current => {}
            _ => best = Some((arm, s)),
        }
    }
    best.map(|(arm, _)| arm).ok_or(PolicyError::NoCandidates)
}
