//! Multi-armed bandit policies and the closed `BanditPolicy` enum over them.

use crate::contextual::ContextualLinUcb;
use crate::snapshot::{DomainSnapshot, SNAPSHOT_VERSION};
use crate::state::{argmax, check_reward, ArmState, PolicyError, PolicyState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use routewise_core::config::LearningConfig;
use routewise_core::{Context, RouteError, RouteResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declarative description of a policy and its parameters. Stored in every
/// snapshot so a domain can be rebuilt on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BanditAlgorithm {
    EpsilonGreedy {
        epsilon: f64,
    },
    Ucb1,
    ThompsonSampling {
        reward_floor: f64,
        reward_ceiling: f64,
    },
    ContextualLinUcb {
        alpha: f64,
        feature_names: Vec<String>,
        #[serde(default = "default_bias")]
        bias: bool,
    },
}

fn default_bias() -> bool {
    true
}

impl Default for BanditAlgorithm {
    fn default() -> Self {
        BanditAlgorithm::ThompsonSampling {
            reward_floor: 0.0,
            reward_ceiling: 1.0,
        }
    }
}

impl BanditAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            BanditAlgorithm::EpsilonGreedy { .. } => "epsilon_greedy",
            BanditAlgorithm::Ucb1 => "ucb1",
            BanditAlgorithm::ThompsonSampling { .. } => "thompson_sampling",
            BanditAlgorithm::ContextualLinUcb { .. } => "contextual_lin_ucb",
        }
    }

    /// Build the configured default algorithm.
    pub fn from_config(config: &LearningConfig) -> RouteResult<Self> {
        let algorithm = match config.default_policy.as_str() {
            "epsilon_greedy" => BanditAlgorithm::EpsilonGreedy {
                epsilon: config.epsilon,
            },
            "ucb1" => BanditAlgorithm::Ucb1,
            "thompson_sampling" => BanditAlgorithm::ThompsonSampling {
                reward_floor: config.reward_floor,
                reward_ceiling: config.reward_ceiling,
            },
            "contextual_lin_ucb" => BanditAlgorithm::ContextualLinUcb {
                alpha: config.linucb_alpha,
                feature_names: config.linucb_features.clone(),
                bias: true,
            },
            other => {
                return Err(RouteError::Config(format!(
                    "unknown bandit policy '{other}'"
                )))
            }
        };
        algorithm.validate()?;
        Ok(algorithm)
    }

    pub fn validate(&self) -> RouteResult<()> {
        match self {
            BanditAlgorithm::EpsilonGreedy { epsilon } if !(0.0..=1.0).contains(epsilon) => Err(
                RouteError::Config(format!("epsilon must be within [0, 1], got {epsilon}")),
            ),
            BanditAlgorithm::ThompsonSampling {
                reward_floor,
                reward_ceiling,
            } if !(reward_floor.is_finite() && reward_ceiling.is_finite())
                || reward_ceiling <= reward_floor =>
            {
                Err(RouteError::Config(format!(
                    "thompson reward range [{reward_floor}, {reward_ceiling}] is empty"
                )))
            }
            BanditAlgorithm::ContextualLinUcb {
                alpha,
                feature_names,
                bias,
            } => {
                if !alpha.is_finite() || *alpha < 0.0 {
                    return Err(RouteError::Config(format!(
                        "linucb alpha must be non-negative, got {alpha}"
                    )));
                }
                if feature_names.is_empty() && !bias {
                    return Err(RouteError::Config(
                        "linucb needs at least one feature or a bias term".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Epsilon-Greedy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EpsilonGreedy {
    epsilon: f64,
    arms: PolicyState,
    rng: StdRng,
}

impl EpsilonGreedy {
    pub fn new(epsilon: f64, rng: StdRng) -> Self {
        Self {
            epsilon,
            arms: PolicyState::new(),
            rng,
        }
    }

    pub fn recommend(&mut self, candidates: &[String]) -> Result<String, PolicyError> {
        if candidates.is_empty() {
            return Err(PolicyError::NoCandidates);
        }
        ensure_arms(&mut self.arms, candidates);

        if self.epsilon > 0.0 && self.rng.gen::<f64>() < self.epsilon {
            let idx = self.rng.gen_range(0..candidates.len());
            return Ok(candidates[idx].clone());
        }

        let arms = &self.arms;
        argmax(candidates, |arm| arms.get(arm).map(|s| s.q).unwrap_or(0.0)).cloned()
    }

    pub fn update(&mut self, arm: &str, reward: f64) -> Result<(), PolicyError> {
        check_reward(reward)?;
        self.arms.entry(arm.to_string()).or_default().observe(reward);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// UCB1
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct Ucb1 {
    arms: PolicyState,
}

impl Ucb1 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recommend(&mut self, candidates: &[String]) -> Result<String, PolicyError> {
        if candidates.is_empty() {
            return Err(PolicyError::NoCandidates);
        }
        ensure_arms(&mut self.arms, candidates);

        // Ordered exploration: every candidate is pulled once before any scoring.
        if let Some(unpulled) = candidates
            .iter()
            .find(|arm| self.arms.get(arm.as_str()).map_or(true, |s| s.count == 0))
        {
            return Ok(unpulled.clone());
        }

        let total_pulls: u64 = candidates
            .iter()
            .filter_map(|arm| self.arms.get(arm.as_str()).map(|s| s.count))
            .sum();
        let log_total = (total_pulls as f64).ln();
        let arms = &self.arms;

        argmax(candidates, |arm| {
            let state = arms.get(arm).copied().unwrap_or_default();
            let exploration = (2.0 * log_total / state.count as f64).sqrt();
            state.q + exploration
        })
        .cloned()
    }

    pub fn update(&mut self, arm: &str, reward: f64) -> Result<(), PolicyError> {
        check_reward(reward)?;
        self.arms.entry(arm.to_string()).or_default().observe(reward);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Thompson Sampling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct BetaArm {
    alpha: f64,
    beta: f64,
    stats: ArmState,
}

impl Default for BetaArm {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            stats: ArmState::default(),
        }
    }
}

/// Beta-posterior Thompson sampling. Rewards are normalised into `[0, 1]`
/// over `[reward_floor, reward_ceiling]` and added as fractional successes.
#[derive(Debug, Clone)]
pub struct ThompsonSampling {
    reward_floor: f64,
    reward_ceiling: f64,
    arms: BTreeMap<String, BetaArm>,
    rng: StdRng,
}

impl ThompsonSampling {
    pub fn new(reward_floor: f64, reward_ceiling: f64, rng: StdRng) -> Self {
        Self {
            reward_floor,
            reward_ceiling,
            arms: BTreeMap::new(),
            rng,
        }
    }

    pub fn recommend(&mut self, candidates: &[String]) -> Result<String, PolicyError> {
        if candidates.is_empty() {
            return Err(PolicyError::NoCandidates);
        }
        for arm in candidates {
            self.arms.entry(arm.clone()).or_default();
        }

        let arms = &self.arms;
        let rng = &mut self.rng;
        argmax(candidates, |arm| {
            let (alpha, beta) = arms
                .get(arm)
                .map(|s| (s.alpha, s.beta))
                .unwrap_or((1.0, 1.0));
            Self::beta_sample(&mut *rng, alpha, beta)
        })
        .cloned()
    }

    pub fn update(&mut self, arm: &str, reward: f64) -> Result<(), PolicyError> {
        check_reward(reward)?;
        let success = self.normalize(reward);
        let state = self.arms.entry(arm.to_string()).or_default();
        state.alpha += success;
        state.beta += 1.0 - success;
        state.stats.observe(reward);
        Ok(())
    }

    /// Posterior mean per arm.
    pub fn posterior_means(&self) -> BTreeMap<String, f64> {
        self.arms
            .iter()
            .map(|(arm, s)| (arm.clone(), s.alpha / (s.alpha + s.beta)))
            .collect()
    }

    fn normalize(&self, reward: f64) -> f64 {
        let span = self.reward_ceiling - self.reward_floor;
        ((reward - self.reward_floor) / span).clamp(0.0, 1.0)
    }

    /// Beta sample approximated by the Irwin-Hall normal (sum of 12 uniforms)
    /// scaled to the Beta mean and variance.
    fn beta_sample(rng: &mut impl Rng, alpha: f64, beta: f64) -> f64 {
        let x: f64 = (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0;
        let mean = alpha / (alpha + beta);
        let variance = (alpha * beta) / ((alpha + beta).powi(2) * (alpha + beta + 1.0));
        (mean + x * variance.sqrt()).clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// BanditPolicy
// ---------------------------------------------------------------------------

/// The four policy families behind one capability set.
#[derive(Debug, Clone)]
pub enum BanditPolicy {
    EpsilonGreedy(EpsilonGreedy),
    Ucb1(Ucb1),
    ThompsonSampling(ThompsonSampling),
    ContextualLinUcb(ContextualLinUcb),
}

impl BanditPolicy {
    /// Build a policy with an entropy-seeded RNG.
    pub fn new(algorithm: &BanditAlgorithm) -> Self {
        Self::build(algorithm, StdRng::from_entropy())
    }

    /// Build a policy with a fixed seed for reproducible exploration.
    pub fn seeded(algorithm: &BanditAlgorithm, seed: u64) -> Self {
        Self::build(algorithm, StdRng::seed_from_u64(seed))
    }

    fn build(algorithm: &BanditAlgorithm, rng: StdRng) -> Self {
        match algorithm {
            BanditAlgorithm::EpsilonGreedy { epsilon } => {
                BanditPolicy::EpsilonGreedy(EpsilonGreedy::new(*epsilon, rng))
            }
            BanditAlgorithm::Ucb1 => BanditPolicy::Ucb1(Ucb1::new()),
            BanditAlgorithm::ThompsonSampling {
                reward_floor,
                reward_ceiling,
            } => BanditPolicy::ThompsonSampling(ThompsonSampling::new(
                *reward_floor,
                *reward_ceiling,
                rng,
            )),
            BanditAlgorithm::ContextualLinUcb {
                alpha,
                feature_names,
                bias,
            } => BanditPolicy::ContextualLinUcb(ContextualLinUcb::new(
                *alpha,
                feature_names.clone(),
                *bias,
            )),
        }
    }

    pub fn algorithm(&self) -> BanditAlgorithm {
        match self {
            BanditPolicy::EpsilonGreedy(p) => BanditAlgorithm::EpsilonGreedy { epsilon: p.epsilon },
            BanditPolicy::Ucb1(_) => BanditAlgorithm::Ucb1,
            BanditPolicy::ThompsonSampling(p) => BanditAlgorithm::ThompsonSampling {
                reward_floor: p.reward_floor,
                reward_ceiling: p.reward_ceiling,
            },
            BanditPolicy::ContextualLinUcb(p) => p.algorithm(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BanditPolicy::EpsilonGreedy(_) => "epsilon_greedy",
            BanditPolicy::Ucb1(_) => "ucb1",
            BanditPolicy::ThompsonSampling(_) => "thompson_sampling",
            BanditPolicy::ContextualLinUcb(_) => "contextual_lin_ucb",
        }
    }

    /// A same-kind policy with empty state, for throwaway evaluation.
    pub fn fresh(&self) -> Self {
        Self::new(&self.algorithm())
    }

    pub fn recommend(&mut self, context: &Context, candidates: &[String]) -> Result<String, PolicyError> {
        match self {
            BanditPolicy::EpsilonGreedy(p) => p.recommend(candidates),
            BanditPolicy::Ucb1(p) => p.recommend(candidates),
            BanditPolicy::ThompsonSampling(p) => p.recommend(candidates),
            BanditPolicy::ContextualLinUcb(p) => p.recommend(context, candidates),
        }
    }

    pub fn update(&mut self, context: &Context, arm: &str, reward: f64) -> Result<(), PolicyError> {
        match self {
            BanditPolicy::EpsilonGreedy(p) => p.update(arm, reward),
            BanditPolicy::Ucb1(p) => p.update(arm, reward),
            BanditPolicy::ThompsonSampling(p) => p.update(arm, reward),
            BanditPolicy::ContextualLinUcb(p) => p.update(context, arm, reward),
        }
    }

    /// Read-only `{q, count}` view per arm.
    pub fn status(&self) -> PolicyState {
        match self {
            BanditPolicy::EpsilonGreedy(p) => p.arms.clone(),
            BanditPolicy::Ucb1(p) => p.arms.clone(),
            BanditPolicy::ThompsonSampling(p) => {
                p.arms.iter().map(|(arm, s)| (arm.clone(), s.stats)).collect()
            }
            BanditPolicy::ContextualLinUcb(p) => p.status(),
        }
    }

    pub fn arms(&self) -> Vec<String> {
        self.status().into_keys().collect()
    }

    pub fn snapshot(&self) -> DomainSnapshot {
        let mut snapshot = DomainSnapshot::new(self.algorithm());
        for (arm, state) in self.status() {
            snapshot.q_values.insert(arm.clone(), state.q);
            snapshot.counts.insert(arm, state.count);
        }
        match self {
            BanditPolicy::ThompsonSampling(p) => {
                for (arm, s) in &p.arms {
                    snapshot.alphas.insert(arm.clone(), s.alpha);
                    snapshot.betas.insert(arm.clone(), s.beta);
                }
            }
            BanditPolicy::ContextualLinUcb(p) => p.write_extras(&mut snapshot),
            _ => {}
        }
        snapshot
    }

    /// Replace all learned state with `snapshot`. State is only swapped in
    /// once the whole snapshot has validated.
    pub fn restore(&mut self, snapshot: &DomainSnapshot) -> Result<(), PolicyError> {
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(PolicyError::InvalidState(format!(
                "version {} is newer than {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        if let Some(policy) = snapshot.policy.as_ref().filter(|p| p.name() != self.kind()) {
            return Err(PolicyError::KindMismatch {
                expected: self.kind(),
                found: policy.name(),
            });
        }
        let arms = restore_arm_states(snapshot)?;

        match self {
            BanditPolicy::EpsilonGreedy(p) => p.arms = arms,
            BanditPolicy::Ucb1(p) => p.arms = arms,
            BanditPolicy::ThompsonSampling(p) => {
                let mut restored = BTreeMap::new();
                for (arm, stats) in arms {
                    let alpha = snapshot.alphas.get(&arm).copied().unwrap_or(1.0);
                    let beta = snapshot.betas.get(&arm).copied().unwrap_or(1.0);
                    if !(alpha.is_finite() && beta.is_finite() && alpha > 0.0 && beta > 0.0) {
                        return Err(PolicyError::InvalidState(format!(
                            "beta posterior for '{arm}' is not positive"
                        )));
                    }
                    restored.insert(arm, BetaArm { alpha, beta, stats });
                }
                p.arms = restored;
            }
            BanditPolicy::ContextualLinUcb(p) => p.restore(snapshot, arms)?,
        }
        Ok(())
    }
}

fn ensure_arms(arms: &mut PolicyState, candidates: &[String]) {
    for arm in candidates {
        arms.entry(arm.clone()).or_default();
    }
}

fn restore_arm_states(snapshot: &DomainSnapshot) -> Result<PolicyState, PolicyError> {
    let mut arms = PolicyState::new();
    for arm in snapshot.arms() {
        let q = snapshot.q_values.get(&arm).copied().unwrap_or(0.0);
        if !q.is_finite() {
            return Err(PolicyError::InvalidState(format!("q for '{arm}' is not finite")));
        }
        let count = snapshot.counts.get(&arm).copied().unwrap_or(0);
        arms.insert(arm, ArmState { count, q });
    }
    Ok(arms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_epsilon_zero_exploits_best_arm() {
        let mut policy = BanditPolicy::seeded(&BanditAlgorithm::EpsilonGreedy { epsilon: 0.0 }, 7);
        let ctx = Context::new();
        policy.update(&ctx, "a", 1.0).unwrap();
        policy.update(&ctx, "b", 0.0).unwrap();
        for _ in 0..20 {
            assert_eq!(policy.recommend(&ctx, &arms(&["a", "b"])).unwrap(), "a");
        }
    }

    #[test]
    fn test_epsilon_one_stays_within_candidates() {
        let mut policy = BanditPolicy::seeded(&BanditAlgorithm::EpsilonGreedy { epsilon: 1.0 }, 11);
        let candidates = arms(&["x", "y", "z"]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let arm = policy.recommend(&Context::new(), &candidates).unwrap();
            assert!(candidates.contains(&arm));
            seen.insert(arm);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_ucb1_covers_every_arm_before_repeating() {
        let mut policy = BanditPolicy::new(&BanditAlgorithm::Ucb1);
        let candidates = arms(&["a", "b", "c", "d"]);
        let ctx = Context::new();
        let mut chosen = Vec::new();
        for _ in 0..candidates.len() {
            let arm = policy.recommend(&ctx, &candidates).unwrap();
            policy.update(&ctx, &arm, 0.9).unwrap();
            chosen.push(arm);
        }
        assert_eq!(chosen, candidates);
    }

    #[test]
    fn test_ucb1_exploits_after_exploration() {
        let mut policy = BanditPolicy::new(&BanditAlgorithm::Ucb1);
        let candidates = arms(&["good", "bad"]);
        let ctx = Context::new();
        for _ in 0..200 {
            let arm = policy.recommend(&ctx, &candidates).unwrap();
            let reward = if arm == "good" { 1.0 } else { 0.0 };
            policy.update(&ctx, &arm, reward).unwrap();
        }
        let status = policy.status();
        assert!(status["good"].count > status["bad"].count * 3);
    }

    #[test]
    fn test_thompson_prefers_rewarded_arm() {
        let algorithm = BanditAlgorithm::ThompsonSampling {
            reward_floor: 0.0,
            reward_ceiling: 1.0,
        };
        let mut policy = BanditPolicy::seeded(&algorithm, 42);
        let ctx = Context::new();
        for _ in 0..50 {
            policy.update(&ctx, "a", 1.0).unwrap();
            policy.update(&ctx, "b", 0.0).unwrap();
        }
        let candidates = arms(&["a", "b"]);
        let picks_a = (0..100)
            .filter(|_| policy.recommend(&ctx, &candidates).unwrap() == "a")
            .count();
        assert!(picks_a > 90, "picked a only {picks_a} times");
    }

    #[test]
    fn test_thompson_normalizes_reward_range() {
        let algorithm = BanditAlgorithm::ThompsonSampling {
            reward_floor: -1.0,
            reward_ceiling: 1.0,
        };
        let mut policy = BanditPolicy::seeded(&algorithm, 1);
        policy.update(&Context::new(), "a", 0.0).unwrap();
        let snapshot = policy.snapshot();
        assert!((snapshot.alphas["a"] - 1.5).abs() < 1e-12);
        assert!((snapshot.betas["a"] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_reward_is_rejected() {
        let mut policy = BanditPolicy::new(&BanditAlgorithm::Ucb1);
        let err = policy.update(&Context::new(), "a", f64::NAN).unwrap_err();
        assert!(matches!(err, PolicyError::NonFiniteReward(_)));
        assert!(policy.status().is_empty());
    }

    #[test]
    fn test_snapshot_restore_preserves_posterior() {
        let algorithm = BanditAlgorithm::ThompsonSampling {
            reward_floor: 0.0,
            reward_ceiling: 1.0,
        };
        let mut policy = BanditPolicy::seeded(&algorithm, 3);
        let ctx = Context::new();
        policy.update(&ctx, "a", 0.8).unwrap();
        policy.update(&ctx, "b", 0.1).unwrap();
        let snapshot = policy.snapshot();

        let mut restored = BanditPolicy::seeded(&algorithm, 4);
        restored.restore(&snapshot).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
    }

    #[test]
    fn test_restore_rejects_other_kind() {
        let mut source = BanditPolicy::new(&BanditAlgorithm::Ucb1);
        source.update(&Context::new(), "a", 1.0).unwrap();
        let mut target = BanditPolicy::new(&BanditAlgorithm::EpsilonGreedy { epsilon: 0.1 });
        let err = target.restore(&source.snapshot()).unwrap_err();
        assert!(matches!(err, PolicyError::KindMismatch { .. }));
        assert!(target.status().is_empty());
    }

    #[test]
    fn test_algorithm_from_config() {
        let mut config = LearningConfig {
            default_policy: "epsilon_greedy".to_string(),
            epsilon: 0.2,
            ..Default::default()
        };
        assert_eq!(
            BanditAlgorithm::from_config(&config).unwrap(),
            BanditAlgorithm::EpsilonGreedy { epsilon: 0.2 }
        );
        config.default_policy = "softmax".to_string();
        assert!(BanditAlgorithm::from_config(&config).is_err());
        config.default_policy = "epsilon_greedy".to_string();
        config.epsilon = 1.5;
        assert!(BanditAlgorithm::from_config(&config).is_err());
    }

    #[test]
    fn test_algorithm_wire_names() {
        let json = serde_json::to_string(&BanditAlgorithm::Ucb1).unwrap();
        assert_eq!(json, r#"{"kind":"ucb1"}"#);
        let parsed: BanditAlgorithm = serde_json::from_str(
            r#"{"kind":"contextual_lin_ucb","alpha":0.5,"feature_names":["tokens"]}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            BanditAlgorithm::ContextualLinUcb {
                alpha: 0.5,
                feature_names: vec!["tokens".to_string()],
                bias: true
            }
        );
    }
}
