//! Optional external optimiser loop. Suggestions are advisory; the first
//! failure of the optimiser switches the manager off for good.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use routewise_core::config::AdaptiveConfig;
use routewise_core::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_TRIAL_TTL: Duration = Duration::from_secs(600);

/// An external suggestion source, e.g. a hyper-parameter optimisation service.
pub trait SuggestionOptimizer: Send + Sync {
    fn suggest(&self, domain: &str, candidates: &[String], context: &Context) -> anyhow::Result<String>;

    fn observe(&self, domain: &str, arm: &str, reward: f64, metadata: &serde_json::Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub trial_id: Uuid,
    pub arm: String,
}

#[derive(Debug, Clone)]
struct Trial {
    /// `None` while the optimiser call that reserved the slot is in flight.
    arm: Option<String>,
    started_at: DateTime<Utc>,
}

pub struct AdaptiveRoutingManager {
    optimizer: Option<Box<dyn SuggestionOptimizer>>,
    enabled: AtomicBool,
    max_outstanding: usize,
    trial_ttl: Duration,
    outstanding: Mutex<HashMap<(String, Uuid), Trial>>,
}

impl AdaptiveRoutingManager {
    pub fn new(optimizer: Box<dyn SuggestionOptimizer>, max_outstanding: usize) -> Self {
        Self {
            optimizer: Some(optimizer),
            enabled: AtomicBool::new(true),
            max_outstanding,
            trial_ttl: DEFAULT_TRIAL_TTL,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// A manager whose every call is a no-op.
    pub fn disabled() -> Self {
        Self {
            optimizer: None,
            enabled: AtomicBool::new(false),
            max_outstanding: 0,
            trial_ttl: DEFAULT_TRIAL_TTL,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    /// Trials not observed within `ttl` are dropped on the next `suggest`.
    pub fn with_trial_ttl(mut self, ttl: Duration) -> Self {
        self.trial_ttl = ttl;
        self
    }

    /// Build from config. A disabled section or a failing `init` yields a
    /// disabled manager.
    pub fn from_config(
        config: &AdaptiveConfig,
        init: impl FnOnce() -> anyhow::Result<Box<dyn SuggestionOptimizer>>,
    ) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        match init() {
            Ok(optimizer) => {
                info!(
                    max_outstanding = config.max_outstanding_trials,
                    trial_ttl_secs = config.trial_ttl_secs,
                    "adaptive routing enabled"
                );
                Self::new(optimizer, config.max_outstanding_trials)
                    .with_trial_ttl(Duration::from_secs(config.trial_ttl_secs))
            }
            Err(err) => {
                warn!(error = %err, "adaptive optimiser failed to initialise; disabled");
                metrics::counter!("routewise.adaptive.disabled").increment(1);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Ask the optimiser for an arm. Returns `None` when disabled, at the
    /// outstanding-trial cap, or when the optimiser misbehaves.
    pub fn suggest(&self, domain: &str, candidates: &[String], context: &Context) -> Option<Suggestion> {
        if !self.is_enabled() || candidates.is_empty() {
            return None;
        }
        let optimizer = self.optimizer.as_ref()?;
        let trial_id = self.reserve(domain)?;
        let key = (domain.to_string(), trial_id);

        let arm = match optimizer.suggest(domain, candidates, context) {
            Ok(arm) if candidates.contains(&arm) => arm,
            Ok(arm) => {
                self.outstanding.lock().remove(&key);
                self.disable(&format!("suggested unknown arm '{arm}'"));
                return None;
            }
            Err(err) => {
                self.outstanding.lock().remove(&key);
                self.disable(&format!("suggest failed: {err}"));
                return None;
            }
        };

        // The slot is gone if the manager was disabled or the trial expired
        // while the optimiser was answering.
        let mut outstanding = self.outstanding.lock();
        let trial = outstanding.get_mut(&key)?;
        trial.arm = Some(arm.clone());
        Some(Suggestion { trial_id, arm })
    }

    /// Close a trial. The reward is forwarded only when `served_arm` is the
    /// suggested arm; otherwise the trial is closed without an observation.
    /// Returns `true` if the optimiser accepted an observation.
    pub fn observe(
        &self,
        domain: &str,
        trial_id: Uuid,
        served_arm: &str,
        reward: f64,
        metadata: &serde_json::Value,
    ) -> bool {
        let removed = self.outstanding.lock().remove(&(domain.to_string(), trial_id));
        let Some(arm) = removed.as_ref().and_then(|trial| trial.arm.as_deref()) else {
            debug!(domain, %trial_id, "observe for unknown trial ignored");
            return false;
        };
        if arm != served_arm {
            debug!(domain, %trial_id, suggested = arm, served = served_arm, "suggestion not followed; trial closed");
            metrics::counter!("routewise.adaptive.not_followed").increment(1);
            return false;
        }
        if !self.is_enabled() {
            return false;
        }
        let Some(optimizer) = self.optimizer.as_ref() else {
            return false;
        };
        match optimizer.observe(domain, arm, reward, metadata) {
            Ok(()) => {
                let elapsed_ms = removed
                    .as_ref()
                    .map_or(0, |trial| (Utc::now() - trial.started_at).num_milliseconds());
                debug!(domain, %trial_id, arm, reward, elapsed_ms, "adaptive trial closed");
                true
            }
            Err(err) => {
                self.disable(&format!("observe failed: {err}"));
                false
            }
        }
    }

    /// Drop expired trials, then claim a slot if one is free. Check and
    /// insert happen under one lock so the cap is never exceeded.
    fn reserve(&self, domain: &str) -> Option<Uuid> {
        let now = Utc::now();
        let ttl = self.trial_ttl;
        let mut outstanding = self.outstanding.lock();

        let before = outstanding.len();
        outstanding.retain(|_, trial| {
            (now - trial.started_at)
                .to_std()
                .map_or(true, |age| age <= ttl)
        });
        let expired = before - outstanding.len();
        if expired > 0 {
            debug!(expired, "expired adaptive trials evicted");
            metrics::counter!("routewise.adaptive.expired").increment(expired as u64);
        }

        if outstanding.len() >= self.max_outstanding {
            debug!(domain, outstanding = outstanding.len(), "adaptive trial cap reached");
            return None;
        }
        let trial_id = Uuid::new_v4();
        outstanding.insert(
            (domain.to_string(), trial_id),
            Trial {
                arm: None,
                started_at: now,
            },
        );
        Some(trial_id)
    }

    fn disable(&self, reason: &str) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            warn!(reason, "adaptive routing disabled");
            metrics::counter!("routewise.adaptive.disabled").increment(1);
            self.outstanding.lock().clear();
        }
    }
}
