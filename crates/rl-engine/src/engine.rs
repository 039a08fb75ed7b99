//! `LearningEngine` owns the policy registry and the reward engine. It is
//! constructed once at start-up and shared behind an `Arc`.

use crate::adaptive::{AdaptiveRoutingManager, Suggestion};
use crate::bandits::{BanditAlgorithm, BanditPolicy};
use crate::registry::PolicyRegistry;
use crate::reward::{RewardEngine, RewardWeights, WeightOverrides};
use crate::shadow::ShadowRegretTracker;
use crate::snapshot::{DomainSnapshot, RestoreReport, Snapshot};
use crate::state::PolicyState;
use routewise_core::config::LearningConfig;
use routewise_core::types::stable_hash;
use routewise_core::{AppConfig, Context, Outcome, RewardBreakdown, RouteError, RouteResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Applied,
    /// Learning is off globally or for the domain; nothing was mutated.
    LearningDisabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BakeoffReport {
    pub domain: String,
    pub policy: String,
    pub rounds: usize,
    pub status: PolicyState,
    /// Highest-`q` arm among those pulled; earlier candidates win ties.
    pub winner: Option<String>,
}

pub struct LearningEngine {
    registry: PolicyRegistry,
    rewards: RewardEngine,
    config: LearningConfig,
    default_algorithm: BanditAlgorithm,
    learning_enabled: AtomicBool,
    shadow: Option<Arc<ShadowRegretTracker>>,
    adaptive: Option<Arc<AdaptiveRoutingManager>>,
}

impl LearningEngine {
    pub fn new(config: &AppConfig) -> RouteResult<Self> {
        let default_algorithm = BanditAlgorithm::from_config(&config.learning)?;
        info!(
            default_policy = default_algorithm.name(),
            learning_enabled = config.learning.enabled,
            "learning engine initialized"
        );
        Ok(Self {
            registry: PolicyRegistry::new(),
            rewards: RewardEngine::new(RewardWeights::from(&config.reward)),
            config: config.learning.clone(),
            default_algorithm,
            learning_enabled: AtomicBool::new(config.learning.enabled),
            shadow: None,
            adaptive: None,
        })
    }

    pub fn with_shadow_tracker(mut self, tracker: Arc<ShadowRegretTracker>) -> Self {
        self.shadow = Some(tracker);
        self
    }

    pub fn with_adaptive_manager(mut self, manager: Arc<AdaptiveRoutingManager>) -> Self {
        self.adaptive = Some(manager);
        self
    }

    pub fn shadow_tracker(&self) -> Option<&Arc<ShadowRegretTracker>> {
        self.shadow.as_ref()
    }

    pub fn adaptive_manager(&self) -> Option<&Arc<AdaptiveRoutingManager>> {
        self.adaptive.as_ref()
    }

    pub fn rewards(&self) -> &RewardEngine {
        &self.rewards
    }

    pub fn default_algorithm(&self) -> &BanditAlgorithm {
        &self.default_algorithm
    }

    /// Build a policy for `domain`. With a configured seed every domain gets
    /// its own reproducible stream.
    pub fn build_policy(&self, domain: &str, algorithm: &BanditAlgorithm) -> BanditPolicy {
        match self.config.seed {
            Some(seed) => BanditPolicy::seeded(algorithm, seed ^ stable_hash(domain)),
            None => BanditPolicy::new(algorithm),
        }
    }

    fn initial_learning(&self, domain: &str) -> bool {
        !self.config.disabled_domains.iter().any(|d| d == domain)
    }

    // ── Domain lifecycle ──────────────────────────────────────────────

    /// Idempotent: returns `false` and keeps the existing policy if `name` is
    /// already registered.
    pub fn register_domain(&self, name: &str, policy: BanditPolicy) -> bool {
        self.registry.register(name, policy, self.initial_learning(name))
    }

    pub fn register_algorithm(&self, name: &str, algorithm: &BanditAlgorithm) -> RouteResult<bool> {
        algorithm.validate()?;
        Ok(self.register_domain(name, self.build_policy(name, algorithm)))
    }

    /// Register `name` with the default policy unless it already exists.
    pub fn ensure_domain(&self, name: &str) -> bool {
        if self.registry.contains(name) {
            return false;
        }
        self.register_domain(name, self.build_policy(name, &self.default_algorithm))
    }

    pub fn unregister_domain(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    pub fn domains(&self) -> Vec<String> {
        self.registry.domains()
    }

    // ── Decisions ─────────────────────────────────────────────────────

    pub fn recommend(&self, domain: &str, context: &Context, candidates: &[String]) -> RouteResult<String> {
        if candidates.is_empty() {
            return Err(RouteError::validation(format!(
                "recommend for '{domain}' needs at least one candidate"
            )));
        }
        let result = self
            .registry
            .with_policy(domain, |policy| policy.recommend(context, candidates))
            .ok_or_else(|| unregistered(domain))?;

        match result {
            Ok(arm) => {
                metrics::counter!("routewise.recommendations").increment(1);
                debug!(domain, arm = %arm, "recommendation");
                Ok(arm)
            }
            Err(err) => {
                warn!(domain, error = %err, "policy failed to recommend");
                metrics::counter!("routewise.policy_failures").increment(1);
                Err(RouteError::policy_failure(domain, err))
            }
        }
    }

    /// Apply `reward` for `arm`. Mutates nothing unless learning is enabled
    /// both globally and for `domain`.
    pub fn record(&self, domain: &str, context: &Context, arm: &str, reward: f64) -> RouteResult<RecordStatus> {
        self.apply_reward(domain, context, arm, reward, true)
    }

    /// Like [`record`](Self::record), for a request that was never executed
    /// (e.g. a budget rejection). Shadow policies and the baseline only score
    /// served requests, so they are not fed.
    pub fn record_unserved(&self, domain: &str, context: &Context, arm: &str, reward: f64) -> RouteResult<RecordStatus> {
        self.apply_reward(domain, context, arm, reward, false)
    }

    fn apply_reward(
        &self,
        domain: &str,
        context: &Context,
        arm: &str,
        reward: f64,
        served: bool,
    ) -> RouteResult<RecordStatus> {
        if !self.is_learning_enabled() {
            return Ok(RecordStatus::LearningDisabled);
        }
        match self.registry.learning_enabled(domain) {
            None => return Err(unregistered(domain)),
            Some(false) => return Ok(RecordStatus::LearningDisabled),
            Some(true) => {}
        }

        let shadow = self.shadow.as_ref().filter(|_| served);
        let want_arms = shadow.is_some();
        let (result, known_arms) = self
            .registry
            .with_policy(domain, |policy| {
                let result = policy.update(context, arm, reward);
                let arms = if want_arms { policy.arms() } else { Vec::new() };
                (result, arms)
            })
            .ok_or_else(|| unregistered(domain))?;

        if let Err(err) = result {
            warn!(domain, arm, error = %err, "policy failed to learn");
            metrics::counter!("routewise.policy_failures").increment(1);
            return Err(RouteError::policy_failure(domain, err));
        }
        metrics::counter!("routewise.records").increment(1);

        if let Some(shadow) = shadow {
            shadow.evaluate(domain, context, &known_arms, arm, reward);
        }
        Ok(RecordStatus::Applied)
    }

    /// Compute the reward for `outcome` and record it in one step.
    pub fn record_outcome(
        &self,
        domain: &str,
        context: &Context,
        arm: &str,
        outcome: &Outcome,
        overrides: Option<&WeightOverrides>,
    ) -> RouteResult<RewardBreakdown> {
        let breakdown = self.rewards.compute_reward(outcome, overrides);
        self.record(domain, context, arm, breakdown.total)?;
        Ok(breakdown)
    }

    // ── Learning toggles ──────────────────────────────────────────────

    pub fn set_learning_enabled(&self, enabled: bool) {
        self.learning_enabled.store(enabled, Ordering::Release);
        info!(enabled, "global learning toggled");
    }

    pub fn is_learning_enabled(&self) -> bool {
        self.learning_enabled.load(Ordering::Acquire)
    }

    pub fn set_domain_learning(&self, domain: &str, enabled: bool) -> RouteResult<()> {
        if self.registry.set_learning_enabled(domain, enabled) {
            Ok(())
        } else {
            Err(unregistered(domain))
        }
    }

    pub fn domain_learning_enabled(&self, domain: &str) -> Option<bool> {
        self.registry.learning_enabled(domain)
    }

    // ── State ─────────────────────────────────────────────────────────

    pub fn status(&self) -> BTreeMap<String, PolicyState> {
        self.registry.status()
    }

    pub fn domain_status(&self, domain: &str) -> Option<PolicyState> {
        self.registry.with_policy(domain, |policy| policy.status())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot()
    }

    pub fn snapshot_domain(&self, domain: &str) -> Option<DomainSnapshot> {
        self.registry.with_policy(domain, |policy| policy.snapshot())
    }

    /// Replace state domain by domain. Entries with an unsupported version or
    /// a mismatched policy kind are skipped and reported; the rest restore.
    /// Domains absent from the registry are created from the snapshot's
    /// policy description; without one they are skipped. Entries without a
    /// policy description restore into the registered policy.
    pub fn restore(&self, snapshot: &Snapshot) -> RestoreReport {
        self.registry.restore(snapshot, |domain, algorithm| {
            (self.build_policy(domain, algorithm), self.initial_learning(domain))
        })
    }

    pub fn restore_domain(&self, domain: &str, state: DomainSnapshot) -> RestoreReport {
        let mut snapshot = Snapshot::new();
        snapshot.insert(domain, state);
        self.restore(&snapshot)
    }

    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> RouteResult<()> {
        let path = path.as_ref();
        let json = self.snapshot().to_json()?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "snapshot saved");
        Ok(())
    }

    pub fn load_snapshot(&self, path: impl AsRef<Path>) -> RouteResult<RestoreReport> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let snapshot = Snapshot::from_json(&json)?;
        info!(path = %path.display(), domains = snapshot.len(), "snapshot loaded");
        Ok(self.restore(&snapshot))
    }

    // ── Offline evaluation ────────────────────────────────────────────

    /// Run `rounds` trials against a disposable copy of the domain's policy
    /// kind. The live policy is never touched.
    pub fn shadow_bakeoff(
        &self,
        domain: &str,
        context: &Context,
        candidates: &[String],
        rounds: usize,
        mut trial_fn: impl FnMut(&str) -> RouteResult<f64>,
    ) -> RouteResult<BakeoffReport> {
        if candidates.is_empty() {
            return Err(RouteError::validation(format!(
                "bakeoff for '{domain}' needs at least one candidate"
            )));
        }
        let mut policy = self
            .registry
            .with_policy(domain, |policy| policy.fresh())
            .ok_or_else(|| unregistered(domain))?;

        for _ in 0..rounds {
            let arm = policy
                .recommend(context, candidates)
                .map_err(|err| RouteError::policy_failure(domain, err))?;
            let reward = trial_fn(&arm)?;
            policy
                .update(context, &arm, reward)
                .map_err(|err| RouteError::policy_failure(domain, err))?;
        }

        let status = policy.status();
        let mut winner: Option<(&String, f64)> = None;
        for arm in candidates {
            if let Some(state) = status.get(arm).filter(|s| s.count > 0) {
                if winner.map_or(true, |(_, best)| state.q > best) {
                    winner = Some((arm, state.q));
                }
            }
        }
        let winner = winner.map(|(arm, _)| arm.clone());
        info!(domain, rounds, winner = ?winner, "shadow bakeoff finished");

        Ok(BakeoffReport {
            domain: domain.to_string(),
            policy: policy.kind().to_string(),
            rounds,
            status,
            winner,
        })
    }

    // ── Adaptive optimiser ────────────────────────────────────────────

    pub fn suggest(&self, domain: &str, candidates: &[String], context: &Context) -> Option<Suggestion> {
        self.adaptive.as_ref()?.suggest(domain, candidates, context)
    }

    pub fn observe_trial(
        &self,
        domain: &str,
        trial_id: Uuid,
        served_arm: &str,
        reward: f64,
        metadata: &serde_json::Value,
    ) -> bool {
        self.adaptive.as_ref().map_or(false, |manager| {
            manager.observe(domain, trial_id, served_arm, reward, metadata)
        })
    }
}

fn unregistered(domain: &str) -> RouteError {
    RouteError::validation(format!("domain '{domain}' is not registered"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotEntry;

    fn engine() -> LearningEngine {
        let mut config = AppConfig::default();
        config.learning.seed = Some(17);
        LearningEngine::new(&config).unwrap()
    }

    fn arms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_recommend_validates_inputs() {
        let engine = engine();
        let ctx = Context::new();
        assert!(matches!(
            engine.recommend("chat", &ctx, &arms(&["a"])),
            Err(RouteError::Validation(_))
        ));
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        assert!(matches!(
            engine.recommend("chat", &ctx, &[]),
            Err(RouteError::Validation(_))
        ));
        let arm = engine.recommend("chat", &ctx, &arms(&["a", "b"])).unwrap();
        assert!(["a", "b"].contains(&arm.as_str()));
    }

    #[test]
    fn test_epsilon_zero_learns_best_arm() {
        let engine = engine();
        engine
            .register_algorithm("chat", &BanditAlgorithm::EpsilonGreedy { epsilon: 0.0 })
            .unwrap();
        let ctx = Context::new();
        engine.record("chat", &ctx, "a", 1.0).unwrap();
        engine.record("chat", &ctx, "b", 0.0).unwrap();
        assert_eq!(engine.recommend("chat", &ctx, &arms(&["a", "b"])).unwrap(), "a");
    }

    #[test]
    fn test_record_respects_learning_toggles() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        let ctx = Context::new();

        engine.set_learning_enabled(false);
        assert_eq!(engine.record("chat", &ctx, "a", 1.0).unwrap(), RecordStatus::LearningDisabled);
        engine.set_learning_enabled(true);

        engine.set_domain_learning("chat", false).unwrap();
        assert_eq!(engine.record("chat", &ctx, "a", 1.0).unwrap(), RecordStatus::LearningDisabled);
        assert!(engine.status()["chat"].is_empty());

        engine.set_domain_learning("chat", true).unwrap();
        assert_eq!(engine.record("chat", &ctx, "a", 1.0).unwrap(), RecordStatus::Applied);
        assert_eq!(engine.status()["chat"]["a"].count, 1);

        assert!(engine.set_domain_learning("missing", true).is_err());
        assert!(matches!(
            engine.record("missing", &ctx, "a", 1.0),
            Err(RouteError::Validation(_))
        ));
    }

    #[test]
    fn test_configured_disabled_domain_starts_frozen() {
        let mut config = AppConfig::default();
        config.learning.disabled_domains = vec!["frozen".to_string()];
        let engine = LearningEngine::new(&config).unwrap();
        engine.ensure_domain("frozen");
        assert_eq!(engine.domain_learning_enabled("frozen"), Some(false));
        assert_eq!(
            engine.record("frozen", &Context::new(), "a", 1.0).unwrap(),
            RecordStatus::LearningDisabled
        );
    }

    #[test]
    fn test_non_finite_reward_is_policy_failure() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        let err = engine.record("chat", &Context::new(), "a", f64::INFINITY).unwrap_err();
        assert!(matches!(err, RouteError::PolicyFailure { .. }));
    }

    #[test]
    fn test_restore_of_snapshot_reproduces_status() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        engine.ensure_domain("search");
        let ctx = Context::new();
        for (arm, reward) in [("a", 0.2), ("b", 0.9), ("a", 0.4)] {
            engine.record("chat", &ctx, arm, reward).unwrap();
            engine.record("search", &ctx, arm, reward).unwrap();
        }
        let before = engine.status();
        let snapshot = engine.snapshot();

        engine.record("chat", &ctx, "b", 0.0).unwrap();
        let report = engine.restore(&snapshot);
        assert_eq!(report.restored.len(), 2);
        assert!(report.skipped.is_empty());
        assert_eq!(engine.status(), before);

        let fresh = self::engine();
        fresh.restore(&Snapshot::from_json(&snapshot.to_json().unwrap()).unwrap());
        assert_eq!(fresh.status(), before);
    }

    #[test]
    fn test_future_version_is_skipped() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        engine.register_algorithm("search", &BanditAlgorithm::Ucb1).unwrap();
        engine.record("chat", &Context::new(), "a", 0.5).unwrap();

        let mut snapshot = engine.snapshot();
        let before_chat = engine.status()["chat"].clone();
        if let Some(SnapshotEntry::Domain(state)) = snapshot.domains.get_mut("chat") {
            state.version = 99;
            state.counts.insert("a".into(), 1000);
        }
        snapshot
            .get_mut("search")
            .unwrap()
            .counts
            .insert("z".into(), 3);

        let report = engine.restore(&snapshot);
        assert_eq!(report.skipped, vec!["chat".to_string()]);
        assert_eq!(report.restored, vec!["search".to_string()]);
        assert_eq!(engine.status()["chat"], before_chat);
        assert_eq!(engine.status()["search"]["z"].count, 3);
    }

    #[test]
    fn test_entry_without_policy_restores_into_registered_domain() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        let json = r#"{
            "chat": {"version": 1, "q_values": {"a": 0.5}, "counts": {"a": 2}},
            "search": {"version": 1, "q_values": {"a": 0.1}, "counts": {"a": 1}}
        }"#;
        let report = engine.restore(&Snapshot::from_json(json).unwrap());
        assert_eq!(report.restored, vec!["chat".to_string()]);
        assert_eq!(report.skipped, vec!["search".to_string()]);
        assert!(!engine.is_registered("search"));

        let status = engine.status();
        assert_eq!(status["chat"]["a"].q, 0.5);
        assert_eq!(status["chat"]["a"].count, 2);
    }

    #[test]
    fn test_random_q_values_survive_json_roundtrip() {
        use rand::{Rng, SeedableRng};

        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let ctx = Context::new();
        for i in 0..2_000 {
            let reward: f64 = rng.gen_range(-1.0..1.0);
            engine.record("chat", &ctx, &format!("arm-{i}"), reward).unwrap();
        }
        // A second pull makes each q a running mean rather than the raw draw.
        for i in 0..2_000 {
            let reward: f64 = rng.gen();
            engine.record("chat", &ctx, &format!("arm-{i}"), reward / 3.0).unwrap();
        }

        let json = engine.snapshot().to_json().unwrap();
        let fresh = self::engine();
        let report = fresh.restore(&Snapshot::from_json(&json).unwrap());
        assert!(report.skipped.is_empty());
        assert_eq!(fresh.status(), engine.status());
    }

    #[test]
    fn test_unserved_reward_skips_shadow_tracker() {
        let tracker = Arc::new(ShadowRegretTracker::new(0.5));
        let engine = engine().with_shadow_tracker(Arc::clone(&tracker));
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        tracker.register_shadow("chat", "eps", BanditPolicy::seeded(&BanditAlgorithm::EpsilonGreedy { epsilon: 0.0 }, 1));

        let ctx = Context::new();
        engine.record("chat", &ctx, "a", 0.6).unwrap();
        assert_eq!(
            engine.record_unserved("chat", &ctx, "b", 0.0).unwrap(),
            RecordStatus::Applied
        );
        assert_eq!(engine.status()["chat"]["b"].count, 1);
        assert_eq!(tracker.baseline().count, 1);
        assert_eq!(tracker.record("eps").unwrap().total_pulls, 1);
    }

    #[test]
    fn test_kind_mismatch_is_skipped() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        let mut state = DomainSnapshot::new(BanditAlgorithm::EpsilonGreedy { epsilon: 0.1 });
        state.q_values.insert("a".into(), 1.0);
        state.counts.insert("a".into(), 2);
        let report = engine.restore_domain("chat", state);
        assert_eq!(report.skipped, vec!["chat".to_string()]);
        assert!(engine.status()["chat"].is_empty());
    }

    #[test]
    fn test_save_and_load_snapshot_file() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        engine.record("chat", &Context::new(), "a", 0.75).unwrap();

        let path = std::env::temp_dir().join(format!("routewise-snapshot-{}.json", Uuid::new_v4()));
        engine.save_snapshot(&path).unwrap();

        let other = self::engine();
        let report = other.load_snapshot(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(report.restored, vec!["chat".to_string()]);
        assert_eq!(other.status(), engine.status());
        assert!(matches!(other.load_snapshot(&path), Err(RouteError::Io(_))));
    }

    #[test]
    fn test_record_outcome_returns_breakdown() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        let outcome = Outcome::new(0.01, 0.0).with_signal("quality", 0.9);
        let breakdown = engine
            .record_outcome("chat", &Context::new(), "a", &outcome, None)
            .unwrap();
        assert!((breakdown.total - 0.8).abs() < 1e-12);
        assert!((engine.status()["chat"]["a"].q - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_bakeoff_leaves_live_policy_untouched() {
        let engine = engine();
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        let candidates = arms(&["cheap", "good"]);
        let report = engine
            .shadow_bakeoff("chat", &Context::new(), &candidates, 40, |arm| {
                Ok(if arm == "good" { 1.0 } else { 0.1 })
            })
            .unwrap();
        assert_eq!(report.winner.as_deref(), Some("good"));
        assert_eq!(report.policy, "ucb1");
        assert!(engine.status()["chat"].is_empty());

        let err = engine
            .shadow_bakeoff("chat", &Context::new(), &candidates, 5, |_| {
                Err(RouteError::Internal(anyhow::anyhow!("trial crashed")))
            })
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn test_record_feeds_shadow_tracker() {
        let tracker = Arc::new(ShadowRegretTracker::new(0.5));
        let engine = engine().with_shadow_tracker(Arc::clone(&tracker));
        engine.register_algorithm("chat", &BanditAlgorithm::Ucb1).unwrap();
        tracker.register_shadow("chat", "eps", BanditPolicy::seeded(&BanditAlgorithm::EpsilonGreedy { epsilon: 0.0 }, 1));

        let ctx = Context::new();
        for _ in 0..5 {
            engine.record("chat", &ctx, "a", 0.6).unwrap();
        }
        assert_eq!(tracker.record("eps").unwrap().total_pulls, 5);
        assert_eq!(tracker.baseline().count, 5);
        assert!((tracker.get_performance_ratio("eps") - 1.0).abs() < 1e-12);
    }
}
