//! Contextual LinUCB with a diagonal approximation of the design matrix.
//! Scoring and updates cost O(d) per arm.

use crate::bandits::BanditAlgorithm;
use crate::snapshot::DomainSnapshot;
use crate::state::{argmax, check_reward, ArmState, PolicyError, PolicyState};
use ndarray::Array1;
use routewise_core::Context;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
struct LinArm {
    /// Diagonal of `A`, identity-initialised.
    a_diag: Array1<f64>,
    b: Array1<f64>,
    /// `A⁻¹ b`, kept in sync on every update.
    theta: Array1<f64>,
    stats: ArmState,
}

impl LinArm {
    fn new(dim: usize) -> Self {
        Self {
            a_diag: Array1::ones(dim),
            b: Array1::zeros(dim),
            theta: Array1::zeros(dim),
            stats: ArmState::default(),
        }
    }

    fn score(&self, x: &Array1<f64>, alpha: f64) -> f64 {
        let exploit = self.theta.dot(x);
        let variance = (x * x / &self.a_diag).sum();
        exploit + alpha * variance.sqrt()
    }

    fn recompute_theta(&mut self) {
        self.theta = &self.b / &self.a_diag;
    }
}

#[derive(Debug, Clone)]
pub struct ContextualLinUcb {
    alpha: f64,
    feature_names: Vec<String>,
    bias: bool,
    arms: BTreeMap<String, LinArm>,
}

impl ContextualLinUcb {
    pub fn new(alpha: f64, feature_names: Vec<String>, bias: bool) -> Self {
        Self {
            alpha,
            feature_names,
            bias,
            arms: BTreeMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.feature_names.len() + usize::from(self.bias)
    }

    pub fn algorithm(&self) -> BanditAlgorithm {
        BanditAlgorithm::ContextualLinUcb {
            alpha: self.alpha,
            feature_names: self.feature_names.clone(),
            bias: self.bias,
        }
    }

    pub fn recommend(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        if candidates.is_empty() {
            return Err(PolicyError::NoCandidates);
        }
        let x = self.features(context)?;
        let dim = self.dim();
        for arm in candidates {
            self.arms.entry(arm.clone()).or_insert_with(|| LinArm::new(dim));
        }

        let arms = &self.arms;
        let alpha = self.alpha;
        argmax(candidates, |arm| {
            arms.get(arm)
                .map(|state| state.score(&x, alpha))
                .unwrap_or(f64::NAN)
        })
        .cloned()
    }

    pub fn update(&mut self, context: &Context, arm: &str, reward: f64) -> Result<(), PolicyError> {
        check_reward(reward)?;
        let x = self.features(context)?;
        let dim = self.dim();
        let state = self
            .arms
            .entry(arm.to_string())
            .or_insert_with(|| LinArm::new(dim));

        state.a_diag += &x.mapv(|v| v * v);
        state.b.scaled_add(reward, &x);
        state.recompute_theta();
        state.stats.observe(reward);
        Ok(())
    }

    pub fn status(&self) -> PolicyState {
        self.arms
            .iter()
            .map(|(arm, state)| (arm.clone(), state.stats))
            .collect()
    }

    /// Learned coefficients per arm, in feature order (bias last).
    pub fn theta(&self, arm: &str) -> Option<Vec<f64>> {
        self.arms.get(arm).map(|state| state.theta.to_vec())
    }

    pub(crate) fn write_extras(&self, snapshot: &mut DomainSnapshot) {
        for (arm, state) in &self.arms {
            snapshot.a_diag.insert(arm.clone(), state.a_diag.to_vec());
            snapshot.b.insert(arm.clone(), state.b.to_vec());
        }
    }

    pub(crate) fn restore(
        &mut self,
        snapshot: &DomainSnapshot,
        arms: PolicyState,
    ) -> Result<(), PolicyError> {
        let dim = self.dim();
        let mut restored = BTreeMap::new();
        for (arm, stats) in arms {
            let mut state = LinArm::new(dim);
            if let Some(a_diag) = snapshot.a_diag.get(&arm) {
                if a_diag.len() != dim || a_diag.iter().any(|v| !v.is_finite() || *v <= 0.0) {
                    return Err(PolicyError::InvalidState(format!(
                        "A diagonal for '{arm}' must hold {dim} positive values"
                    )));
                }
                state.a_diag = Array1::from_vec(a_diag.clone());
            }
            if let Some(b) = snapshot.b.get(&arm) {
                if b.len() != dim || b.iter().any(|v| !v.is_finite()) {
                    return Err(PolicyError::InvalidState(format!(
                        "b vector for '{arm}' must hold {dim} finite values"
                    )));
                }
                state.b = Array1::from_vec(b.clone());
            }
            state.recompute_theta();
            state.stats = stats;
            restored.insert(arm, state);
        }
        self.arms = restored;
        Ok(())
    }

    fn features(&self, context: &Context) -> Result<Array1<f64>, PolicyError> {
        let x = context.feature_vector(&self.feature_names, self.bias);
        if let Some(idx) = x.iter().position(|v| !v.is_finite()) {
            let name = self
                .feature_names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| "bias".to_string());
            return Err(PolicyError::NonFiniteContext(name));
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_ctx(a: bool) -> Context {
        Context::new()
            .with("segment_a", if a { 1.0 } else { 0.0 })
            .with("segment_b", if a { 0.0 } else { 1.0 })
    }

    fn policy() -> ContextualLinUcb {
        ContextualLinUcb::new(
            0.5,
            vec!["segment_a".to_string(), "segment_b".to_string()],
            false,
        )
    }

    #[test]
    fn test_untrained_arms_tie_to_first_candidate() {
        let mut linucb = policy();
        let candidates = vec!["x".to_string(), "y".to_string()];
        assert_eq!(linucb.recommend(&segment_ctx(true), &candidates).unwrap(), "x");
        assert_eq!(linucb.status().len(), 2);
    }

    #[test]
    fn test_learns_context_dependent_routing() {
        let mut linucb = policy();
        for i in 0..200 {
            let is_a = i % 2 == 0;
            let ctx = segment_ctx(is_a);
            linucb.update(&ctx, "x", if is_a { 1.0 } else { 0.0 }).unwrap();
            linucb.update(&ctx, "y", if is_a { 0.0 } else { 1.0 }).unwrap();
        }
        let candidates = vec!["x".to_string(), "y".to_string()];
        assert_eq!(linucb.recommend(&segment_ctx(true), &candidates).unwrap(), "x");
        assert_eq!(linucb.recommend(&segment_ctx(false), &candidates).unwrap(), "y");
    }

    #[test]
    fn test_update_accumulates_diagonal() {
        let mut linucb = policy();
        let ctx = Context::new().with("segment_a", 2.0).with("segment_b", 0.0);
        linucb.update(&ctx, "x", 0.5).unwrap();

        let mut snapshot = DomainSnapshot::new(linucb.algorithm());
        linucb.write_extras(&mut snapshot);
        assert_eq!(snapshot.a_diag["x"], vec![5.0, 1.0]);
        assert_eq!(snapshot.b["x"], vec![1.0, 0.0]);
        assert_eq!(linucb.theta("x").unwrap(), vec![0.2, 0.0]);
    }

    #[test]
    fn test_non_finite_feature_is_rejected() {
        let mut linucb = policy();
        let ctx = Context::new().with("segment_a", f64::NAN);
        let err = linucb
            .recommend(&ctx, &["x".to_string()])
            .unwrap_err();
        assert_eq!(err, PolicyError::NonFiniteContext("segment_a".to_string()));
    }

    #[test]
    fn test_restore_rejects_wrong_dimension() {
        let mut linucb = policy();
        let mut snapshot = DomainSnapshot::new(linucb.algorithm());
        snapshot.q_values.insert("x".into(), 0.0);
        snapshot.counts.insert("x".into(), 1);
        snapshot.a_diag.insert("x".into(), vec![1.0, 1.0, 1.0]);
        let arms = PolicyState::from([("x".to_string(), ArmState { count: 1, q: 0.0 })]);
        assert!(linucb.restore(&snapshot, arms).is_err());
    }
}
