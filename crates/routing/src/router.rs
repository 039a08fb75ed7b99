//! End-to-end decision flow: permitted candidates → bandit selection →
//! budget admission → advisory adaptive suggestion. Outcomes flow back through
//! `report_outcome`.

use crate::feedback::LearningFeedback;
use crate::permissions::PermissionRegistry;
use crate::strategy::BanditStrategy;
use chrono::{DateTime, Utc};
use routewise_budget::{BudgetEnforcer, BudgetRequest, SpendTracker};
use routewise_core::{AppConfig, Context, Outcome, RewardBreakdown, RouteError, RouteResult};
use routewise_rl_engine::{
    AdaptiveRoutingManager, LearningEngine, RestoreReport, ShadowRegretTracker, Suggestion, SuggestionOptimizer,
    WeightOverrides,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    #[serde(default = "Uuid::new_v4")]
    pub request_id: Uuid,
    pub tenant: String,
    /// Also the learning domain.
    pub task_type: String,
    #[serde(default)]
    pub context: Context,
    pub candidates: Vec<String>,
    /// Caller-supplied cost per candidate, used when no estimator is set or it
    /// has no answer.
    #[serde(default)]
    pub projected_costs: BTreeMap<String, f64>,
    #[serde(default)]
    pub ceiling_override: Option<f64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RouteRequest {
    pub fn new(tenant: &str, task_type: &str, candidates: &[&str]) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            tenant: tenant.to_string(),
            task_type: task_type.to_string(),
            context: Context::new(),
            candidates: candidates.iter().map(|c| c.to_string()).collect(),
            projected_costs: BTreeMap::new(),
            ceiling_override: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_cost(mut self, arm: &str, cost: f64) -> Self {
        self.projected_costs.insert(arm.to_string(), cost);
        self
    }

    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        self.ceiling_override = Some(ceiling);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub decision_id: Uuid,
    pub request_id: Uuid,
    pub tenant: String,
    pub task_type: String,
    /// What the policy (or the fallback) chose.
    pub recommended_arm: String,
    /// What will actually run, after any budget substitution.
    pub final_arm: String,
    pub final_cost: f64,
    pub substituted: bool,
    pub fallback: bool,
    pub suggestion: Option<Suggestion>,
    pub context: Context,
    pub decided_at: DateTime<Utc>,
}

pub struct AdaptiveRouter {
    engine: Arc<LearningEngine>,
    enforcer: Arc<BudgetEnforcer>,
    permissions: Option<Arc<dyn PermissionRegistry>>,
    snapshot_path: Option<PathBuf>,
}

impl AdaptiveRouter {
    pub fn new(engine: Arc<LearningEngine>, enforcer: Arc<BudgetEnforcer>) -> Self {
        Self {
            engine,
            enforcer,
            permissions: None,
            snapshot_path: None,
        }
    }

    /// Wire an engine, enforcer and learning feedback from configuration.
    /// A shadow tracker is attached when `shadow.enabled`. An existing
    /// snapshot at `learning.snapshot_path` is restored.
    pub fn from_config(config: &AppConfig, tracker: Arc<dyn SpendTracker>) -> RouteResult<Self> {
        if config.adaptive.enabled {
            warn!("adaptive.enabled is set but no optimiser was supplied; adaptive routing stays off");
        }
        Self::build(config, tracker, None)
    }

    /// Like [`from_config`](Self::from_config), with an external optimiser
    /// attached per the `adaptive` section. `init` runs only when
    /// `adaptive.enabled`; a failing `init` leaves adaptive routing off.
    pub fn from_config_with_optimizer(
        config: &AppConfig,
        tracker: Arc<dyn SpendTracker>,
        init: impl FnOnce() -> anyhow::Result<Box<dyn SuggestionOptimizer>>,
    ) -> RouteResult<Self> {
        let manager = AdaptiveRoutingManager::from_config(&config.adaptive, init);
        Self::build(config, tracker, Some(Arc::new(manager)))
    }

    fn build(
        config: &AppConfig,
        tracker: Arc<dyn SpendTracker>,
        adaptive: Option<Arc<AdaptiveRoutingManager>>,
    ) -> RouteResult<Self> {
        let mut engine = LearningEngine::new(config)?;
        if config.shadow.enabled {
            engine = engine.with_shadow_tracker(Arc::new(ShadowRegretTracker::from_config(&config.shadow)));
        }
        if let Some(manager) = adaptive {
            engine = engine.with_adaptive_manager(manager);
        }
        let engine = Arc::new(engine);
        let enforcer = BudgetEnforcer::new(config.budget.clone(), tracker)
            .with_feedback(Arc::new(LearningFeedback::new(Arc::clone(&engine))));

        let mut router = Self::new(engine, Arc::new(enforcer));
        if let Some(path) = &config.learning.snapshot_path {
            let path = PathBuf::from(path);
            if path.exists() {
                let report = router.engine.load_snapshot(&path)?;
                info!(
                    path = %path.display(),
                    restored = report.restored.len(),
                    skipped = report.skipped.len(),
                    "learning state restored at start-up"
                );
            }
            router.snapshot_path = Some(path);
        }
        Ok(router)
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionRegistry>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn engine(&self) -> &Arc<LearningEngine> {
        &self.engine
    }

    pub fn enforcer(&self) -> &Arc<BudgetEnforcer> {
        &self.enforcer
    }

    pub fn strategy(&self, tenant: &str, task_type: &str) -> BanditStrategy {
        let strategy = BanditStrategy::new(Arc::clone(&self.engine), task_type).with_tenant(tenant);
        match &self.permissions {
            Some(permissions) => strategy.with_permissions(Arc::clone(permissions)),
            None => strategy,
        }
    }

    pub fn route(&self, request: &RouteRequest) -> RouteResult<RoutingDecision> {
        let start = std::time::Instant::now();
        if request.candidates.is_empty() {
            return Err(RouteError::validation(format!(
                "route request {} has no candidates",
                request.request_id
            )));
        }

        let strategy = self.strategy(&request.tenant, &request.task_type);
        let selection = strategy.select_detailed(&request.context, &request.candidates)?;
        let projected_cost = self.cost_of(request, &selection.arm).ok_or_else(|| {
            RouteError::validation(format!("no projected cost for arm '{}'", selection.arm))
        })?;

        let mut budget_request = BudgetRequest::new(
            &request.tenant,
            &request.task_type,
            &selection.arm,
            projected_cost,
        )
        .with_payload(request.payload.clone())
        .with_context(request.context.clone());
        if let Some(ceiling) = request.ceiling_override {
            budget_request = budget_request.with_ceiling(ceiling);
        }
        if let Some((arm, cost)) = self.cheapest_alternative(request, &selection.permitted, &selection.arm) {
            budget_request = budget_request.with_alternative(&arm, cost);
        }

        let budget = self.enforcer.check(&budget_request);
        metrics::histogram!("routewise.route.latency_us").record(start.elapsed().as_micros() as f64);
        if let Some(rejection) = budget.error {
            return Err(RouteError::BudgetExceeded(rejection));
        }

        let final_arm = budget.final_arm.unwrap_or_else(|| selection.arm.clone());
        let final_cost = budget.final_cost.unwrap_or(projected_cost);
        let suggestion = self
            .engine
            .suggest(&request.task_type, &selection.permitted, &request.context);

        let decision = RoutingDecision {
            decision_id: Uuid::new_v4(),
            request_id: request.request_id,
            tenant: request.tenant.clone(),
            task_type: request.task_type.clone(),
            recommended_arm: selection.arm,
            final_arm,
            final_cost,
            substituted: budget.substituted_arm.is_some(),
            fallback: selection.fallback,
            suggestion,
            context: request.context.clone(),
            decided_at: Utc::now(),
        };
        debug!(
            decision_id = %decision.decision_id,
            tenant = %decision.tenant,
            task_type = %decision.task_type,
            arm = %decision.final_arm,
            cost = decision.final_cost,
            substituted = decision.substituted,
            fallback = decision.fallback,
            "route decided"
        );
        Ok(decision)
    }

    /// Charge the actual spend, learn from the outcome and close any adaptive
    /// trial. Spend is charged even when learning is disabled. The optimiser
    /// only hears about the outcome if its suggestion was the arm served.
    pub fn report_outcome(
        &self,
        decision: &RoutingDecision,
        outcome: &Outcome,
        overrides: Option<&WeightOverrides>,
    ) -> RouteResult<RewardBreakdown> {
        self.enforcer
            .tracker()
            .record_spend(&decision.tenant, &decision.task_type, outcome.cost_usd);

        let breakdown = self.engine.record_outcome(
            &decision.task_type,
            &decision.context,
            &decision.final_arm,
            outcome,
            overrides,
        )?;

        if let Some(suggestion) = &decision.suggestion {
            let metadata = serde_json::json!({
                "decision_id": decision.decision_id,
                "tenant": decision.tenant,
                "served_arm": decision.final_arm,
            });
            self.engine.observe_trial(
                &decision.task_type,
                suggestion.trial_id,
                &decision.final_arm,
                breakdown.total,
                &metadata,
            );
        }
        Ok(breakdown)
    }

    /// Write learning state to the configured snapshot path, if any.
    pub fn persist(&self) -> RouteResult<bool> {
        match &self.snapshot_path {
            Some(path) => {
                self.engine.save_snapshot(path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn restore_from(&self, path: &std::path::Path) -> RouteResult<RestoreReport> {
        self.engine.load_snapshot(path)
    }

    fn cost_of(&self, request: &RouteRequest, arm: &str) -> Option<f64> {
        self.enforcer
            .estimator()
            .and_then(|estimator| estimator.projected_cost(&request.payload, arm))
            .or_else(|| request.projected_costs.get(arm).copied())
    }

    /// Cheapest permitted candidate other than `chosen`; earlier candidates
    /// win ties. Candidates without a known cost are skipped.
    fn cheapest_alternative(&self, request: &RouteRequest, permitted: &[String], chosen: &str) -> Option<(String, f64)> {
        let mut best: Option<(String, f64)> = None;
        for arm in permitted.iter().filter(|arm| arm.as_str() != chosen) {
            let Some(cost) = self.cost_of(request, arm).filter(|c| c.is_finite()) else {
                continue;
            };
            if best.as_ref().map_or(true, |(_, current)| cost < *current) {
                best = Some((arm.clone(), cost));
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routewise_budget::InMemorySpendTracker;

    fn router(tracker: &InMemorySpendTracker) -> AdaptiveRouter {
        let mut config = AppConfig::default();
        config.learning.default_policy = "ucb1".to_string();
        AdaptiveRouter::from_config(&config, Arc::new(tracker.clone())).unwrap()
    }

    fn request() -> RouteRequest {
        RouteRequest::new("acme", "chat", &["large", "medium", "small"])
            .with_cost("large", 0.10)
            .with_cost("medium", 0.06)
            .with_cost("small", 0.04)
    }

    #[test]
    fn test_cheapest_alternative_skips_chosen_arm() {
        let router = router(&InMemorySpendTracker::new());
        let request = request();
        let permitted = request.candidates.clone();
        assert_eq!(
            router.cheapest_alternative(&request, &permitted, "small"),
            Some(("medium".to_string(), 0.06))
        );
        assert_eq!(
            router.cheapest_alternative(&request, &permitted, "large"),
            Some(("small".to_string(), 0.04))
        );
    }

    #[test]
    fn test_missing_cost_is_validation_error() {
        let router = router(&InMemorySpendTracker::new());
        let request = RouteRequest::new("acme", "chat", &["large"]);
        assert!(matches!(router.route(&request), Err(RouteError::Validation(_))));
    }

    #[test]
    fn test_report_outcome_charges_and_learns() {
        let tracker = InMemorySpendTracker::new();
        let router = router(&tracker);
        let decision = router.route(&request()).unwrap();
        // UCB1 explores candidates in order.
        assert_eq!(decision.final_arm, "large");

        let outcome = Outcome::new(0.09, 120.0).with_signal("quality", 0.8);
        let breakdown = router.report_outcome(&decision, &outcome, None).unwrap();
        assert!((tracker.spent("acme", "chat") - 0.09).abs() < 1e-12);
        let status = router.engine().status();
        assert_eq!(status["chat"]["large"].count, 1);
        assert!((status["chat"]["large"].q - breakdown.total).abs() < 1e-12);
    }
}
