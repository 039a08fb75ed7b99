//! Shadow evaluation: candidate policies observe production traffic and are
//! scored against a running baseline without ever influencing a decision.

use crate::bandits::BanditPolicy;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use routewise_core::config::ShadowConfig;
use routewise_core::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub reward: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowRecord {
    pub cumulative_regret: f64,
    pub total_pulls: u64,
    pub total_reward: f64,
    pub matches: u64,
}

impl ShadowRecord {
    pub fn average_reward(&self) -> f64 {
        if self.total_pulls == 0 {
            0.0
        } else {
            self.total_reward / self.total_pulls as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowReport {
    pub name: String,
    pub domain: Option<String>,
    pub total_pulls: u64,
    pub match_rate: f64,
    pub cumulative_regret: f64,
    pub regret_percentage: f64,
    pub performance_ratio: f64,
    pub computed_at: DateTime<Utc>,
}

struct ShadowPolicy {
    domain: String,
    policy: Mutex<BanditPolicy>,
}

pub struct ShadowRegretTracker {
    blend_factor: f64,
    baseline: Mutex<Baseline>,
    records: dashmap::DashMap<String, ShadowRecord>,
    policies: dashmap::DashMap<String, ShadowPolicy>,
}

impl ShadowRegretTracker {
    pub fn new(blend_factor: f64) -> Self {
        Self {
            blend_factor: blend_factor.clamp(0.0, 1.0),
            baseline: Mutex::new(Baseline::default()),
            records: dashmap::DashMap::new(),
            policies: dashmap::DashMap::new(),
        }
    }

    pub fn from_config(config: &ShadowConfig) -> Self {
        Self::new(config.blend_factor)
    }

    /// Attach a shadow policy to `domain`. Replaces any shadow of the same name
    /// and resets its record.
    pub fn register_shadow(&self, domain: &str, name: &str, policy: BanditPolicy) {
        info!(domain, shadow = name, policy = policy.kind(), "shadow policy registered");
        self.policies.insert(
            name.to_string(),
            ShadowPolicy {
                domain: domain.to_string(),
                policy: Mutex::new(policy),
            },
        );
        self.records.insert(name.to_string(), ShadowRecord::default());
    }

    pub fn remove_shadow(&self, name: &str) -> bool {
        let had_policy = self.policies.remove(name).is_some();
        let had_record = self.records.remove(name).is_some();
        had_policy || had_record
    }

    pub fn shadows(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    pub fn record_baseline(&self, reward: f64) {
        if !reward.is_finite() {
            warn!(reward, "ignoring non-finite baseline reward");
            return;
        }
        let mut baseline = self.baseline.lock();
        baseline.count += 1;
        baseline.reward += (reward - baseline.reward) / baseline.count as f64;
    }

    pub fn baseline(&self) -> Baseline {
        *self.baseline.lock()
    }

    /// Regret is measured against the baseline as it stands when the result
    /// arrives.
    pub fn record_shadow_result(&self, name: &str, reward: f64, matched: bool) {
        if !reward.is_finite() {
            warn!(shadow = name, reward, "ignoring non-finite shadow reward");
            return;
        }
        let baseline = self.baseline.lock().reward;
        let mut record = self.records.entry(name.to_string()).or_default();
        record.total_pulls += 1;
        record.total_reward += reward;
        record.cumulative_regret += (baseline - reward).max(0.0);
        if matched {
            record.matches += 1;
        }
    }

    pub fn record(&self, name: &str) -> Option<ShadowRecord> {
        self.records.get(name).map(|r| r.clone())
    }

    /// Average regret per pull as a percentage of the baseline reward.
    pub fn get_regret_percentage(&self, name: &str) -> f64 {
        let baseline = self.baseline.lock().reward;
        match self.records.get(name) {
            Some(record) if record.total_pulls > 0 && baseline != 0.0 => {
                let avg_regret = record.cumulative_regret / record.total_pulls as f64;
                avg_regret / baseline.abs() * 100.0
            }
            _ => 0.0,
        }
    }

    /// Shadow average reward relative to the baseline. Exactly 1.0 without pulls;
    /// above 1.0 only when the shadow average beats the baseline.
    pub fn get_performance_ratio(&self, name: &str) -> f64 {
        let baseline = self.baseline.lock().reward;
        let average = match self.records.get(name) {
            Some(record) if record.total_pulls > 0 => record.average_reward(),
            _ => return 1.0,
        };
        if baseline > 0.0 {
            average / baseline
        } else {
            // Rewards may be negative; map the difference onto a ratio around 1.0.
            1.0 + (average - baseline) / (baseline.abs() + 1.0)
        }
    }

    /// Feed one production observation to every shadow attached to `domain`.
    ///
    /// Each shadow picks an arm from `candidates`. A pick that matches the
    /// production arm is credited the observed reward; any other pick gets an
    /// estimate blending the shadow's own value for that arm with the baseline.
    /// The estimate is an approximation: the counterfactual reward is never
    /// observed. Shadows then learn from the production observation itself.
    pub fn evaluate(
        &self,
        domain: &str,
        context: &Context,
        candidates: &[String],
        production_arm: &str,
        reward: f64,
    ) {
        if !reward.is_finite() {
            return;
        }
        self.record_baseline(reward);
        let baseline = self.baseline.lock().reward;

        let attached: Vec<String> = self
            .policies
            .iter()
            .filter(|entry| entry.domain == domain)
            .map(|entry| entry.key().clone())
            .collect();

        for name in attached {
            let Some(entry) = self.policies.get(&name) else {
                continue;
            };
            let mut policy = entry.policy.lock();
            let pick = match policy.recommend(context, candidates) {
                Ok(arm) => arm,
                Err(err) => {
                    warn!(domain, shadow = %name, error = %err, "shadow policy failed to recommend");
                    continue;
                }
            };

            let matched = pick == production_arm;
            let shadow_reward = if matched {
                reward
            } else {
                match policy.status().get(&pick) {
                    Some(state) if state.count > 0 => {
                        self.blend_factor * state.q + (1.0 - self.blend_factor) * baseline
                    }
                    _ => baseline,
                }
            };

            if let Err(err) = policy.update(context, production_arm, reward) {
                warn!(domain, shadow = %name, error = %err, "shadow policy failed to learn");
            }
            drop(policy);
            drop(entry);

            self.record_shadow_result(&name, shadow_reward, matched);
            debug!(domain, shadow = %name, pick = %pick, matched, shadow_reward, "shadow evaluated");
        }
        metrics::counter!("routewise.shadow.evaluations").increment(1);
    }

    pub fn report(&self) -> Vec<ShadowReport> {
        let now = Utc::now();
        self.shadows()
            .into_iter()
            .filter_map(|name| {
                let record = self.record(&name)?;
                let domain = self.policies.get(&name).map(|p| p.domain.clone());
                let match_rate = if record.total_pulls > 0 {
                    record.matches as f64 / record.total_pulls as f64
                } else {
                    0.0
                };
                Some(ShadowReport {
                    regret_percentage: self.get_regret_percentage(&name),
                    performance_ratio: self.get_performance_ratio(&name),
                    name,
                    domain,
                    total_pulls: record.total_pulls,
                    match_rate,
                    cumulative_regret: record.cumulative_regret,
                    computed_at: now,
                })
            })
            .collect()
    }
}

impl Default for ShadowRegretTracker {
    fn default() -> Self {
        Self::from_config(&ShadowConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandits::BanditAlgorithm;

    #[test]
    fn test_ratio_is_one_without_pulls() {
        let tracker = ShadowRegretTracker::new(0.5);
        tracker.record_baseline(0.8);
        assert_eq!(tracker.get_performance_ratio("never-run"), 1.0);
        assert_eq!(tracker.get_regret_percentage("never-run"), 0.0);
    }

    #[test]
    fn test_baseline_is_running_average() {
        let tracker = ShadowRegretTracker::new(0.5);
        for reward in [1.0, 0.0, 0.5, 0.5] {
            tracker.record_baseline(reward);
        }
        let baseline = tracker.baseline();
        assert_eq!(baseline.count, 4);
        assert!((baseline.reward - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_regret_only_counts_shortfall() {
        let tracker = ShadowRegretTracker::new(0.5);
        tracker.record_baseline(0.5);
        tracker.record_shadow_result("s", 0.3, false);
        tracker.record_shadow_result("s", 0.9, false);

        let record = tracker.record("s").unwrap();
        assert_eq!(record.total_pulls, 2);
        assert!((record.cumulative_regret - 0.2).abs() < 1e-12);
        assert!((tracker.get_regret_percentage("s") - 20.0).abs() < 1e-9);
        assert!(tracker.get_performance_ratio("s") > 1.0);
    }

    #[test]
    fn test_worse_shadow_has_ratio_below_one() {
        let tracker = ShadowRegretTracker::new(0.5);
        tracker.record_baseline(0.8);
        tracker.record_shadow_result("s", 0.4, false);
        assert!((tracker.get_performance_ratio("s") - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_evaluate_only_touches_domain_shadows() {
        let tracker = ShadowRegretTracker::new(0.5);
        tracker.register_shadow("chat", "chat-ucb", BanditPolicy::new(&BanditAlgorithm::Ucb1));
        tracker.register_shadow("search", "search-ucb", BanditPolicy::new(&BanditAlgorithm::Ucb1));

        let candidates = vec!["fast".to_string(), "smart".to_string()];
        // A fresh UCB1 shadow explores "fast" first, matching production.
        tracker.evaluate("chat", &Context::new(), &candidates, "fast", 0.7);

        let chat = tracker.record("chat-ucb").unwrap();
        assert_eq!(chat.total_pulls, 1);
        assert_eq!(chat.matches, 1);
        assert!((chat.total_reward - 0.7).abs() < 1e-12);
        assert_eq!(tracker.record("search-ucb").unwrap().total_pulls, 0);

        let report = tracker.report();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].name, "chat-ucb");
        assert_eq!(report[0].match_rate, 1.0);
    }

    #[test]
    fn test_mismatched_pick_uses_baseline_estimate() {
        let tracker = ShadowRegretTracker::new(0.5);
        tracker.register_shadow("chat", "s", BanditPolicy::new(&BanditAlgorithm::Ucb1));
        let candidates = vec!["fast".to_string(), "smart".to_string()];
        tracker.evaluate("chat", &Context::new(), &candidates, "smart", 0.6);

        let record = tracker.record("s").unwrap();
        assert_eq!(record.matches, 0);
        // Unseen pick falls back to the baseline, so no regret accrues.
        assert!((record.total_reward - 0.6).abs() < 1e-12);
        assert_eq!(record.cumulative_regret, 0.0);
    }

    #[test]
    fn test_remove_shadow() {
        let tracker = ShadowRegretTracker::new(0.5);
        tracker.register_shadow("chat", "s", BanditPolicy::new(&BanditAlgorithm::Ucb1));
        assert!(tracker.remove_shadow("s"));
        assert!(!tracker.remove_shadow("s"));
        assert!(tracker.report().is_empty());
    }
}
