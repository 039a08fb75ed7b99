//! Synchronous admission decision: approve, substitute once, or reject.

use crate::tracker::SpendTracker;
use routewise_core::config::BudgetConfig;
use routewise_core::{BudgetDecision, BudgetLimit, BudgetRejection, Context, RouteError, RouteResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Re-estimates the cost of running `arm` on a request payload.
pub trait CostEstimator: Send + Sync {
    fn projected_cost(&self, payload: &serde_json::Value, arm: &str) -> Option<f64>;
}

/// Receives every rejection, e.g. to feed a zero-reward signal back into
/// learning.
pub trait BudgetFeedback: Send + Sync {
    fn budget_rejected(&self, rejection: &BudgetRejection);
}

/// The single affordable fallback the caller precomputed for this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub arm: String,
    pub projected_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRequest {
    pub tenant: String,
    pub task_type: String,
    pub arm: String,
    pub projected_cost: f64,
    #[serde(default)]
    pub ceiling_override: Option<f64>,
    #[serde(default)]
    pub alternative: Option<Alternative>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Carried into any rejection so feedback lands under the same context.
    #[serde(default)]
    pub context: Context,
}

impl BudgetRequest {
    pub fn new(tenant: &str, task_type: &str, arm: &str, projected_cost: f64) -> Self {
        Self {
            tenant: tenant.to_string(),
            task_type: task_type.to_string(),
            arm: arm.to_string(),
            projected_cost,
            ceiling_override: None,
            alternative: None,
            payload: serde_json::Value::Null,
            context: Context::new(),
        }
    }

    pub fn with_ceiling(mut self, ceiling: f64) -> Self {
        self.ceiling_override = Some(ceiling);
        self
    }

    pub fn with_alternative(mut self, arm: &str, projected_cost: f64) -> Self {
        self.alternative = Some(Alternative {
            arm: arm.to_string(),
            projected_cost,
        });
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

pub struct BudgetEnforcer {
    config: BudgetConfig,
    tracker: Arc<dyn SpendTracker>,
    estimator: Option<Arc<dyn CostEstimator>>,
    feedback: Option<Arc<dyn BudgetFeedback>>,
}

impl BudgetEnforcer {
    pub fn new(config: BudgetConfig, tracker: Arc<dyn SpendTracker>) -> Self {
        Self {
            config,
            tracker,
            estimator: None,
            feedback: None,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_feedback(mut self, feedback: Arc<dyn BudgetFeedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn tracker(&self) -> &Arc<dyn SpendTracker> {
        &self.tracker
    }

    pub fn estimator(&self) -> Option<&Arc<dyn CostEstimator>> {
        self.estimator.as_ref()
    }

    pub fn effective_ceiling(&self, tenant: &str, call_override: Option<f64>) -> f64 {
        self.config.effective_ceiling(tenant, call_override)
    }

    /// Decide whether `request` may run. The tracker is consulted but never
    /// charged; callers record actual spend after execution.
    ///
    /// 1. Cumulative budget exhausted: one substitution attempt, else reject.
    /// 2. Cost above the per-request ceiling: one substitution attempt, else reject.
    /// 3. Otherwise approve as proposed.
    pub fn check(&self, request: &BudgetRequest) -> BudgetDecision {
        let ceiling = self.effective_ceiling(&request.tenant, request.ceiling_override);
        let cost = request.projected_cost;

        let limit = if !cost.is_finite() || cost < 0.0 {
            warn!(tenant = %request.tenant, arm = %request.arm, cost, "invalid projected cost");
            Some(BudgetLimit::PerRequest)
        } else if !self
            .tracker
            .can_charge(&request.tenant, &request.task_type, cost)
        {
            Some(BudgetLimit::Cumulative)
        } else if cost > ceiling {
            Some(BudgetLimit::PerRequest)
        } else {
            None
        };

        match limit {
            None => {
                metrics::counter!("routewise.budget.approved").increment(1);
                debug!(tenant = %request.tenant, arm = %request.arm, cost, ceiling, "budget approved");
                BudgetDecision::approve(&request.arm, cost)
            }
            Some(limit) => self.substitute_or_reject(request, limit, ceiling),
        }
    }

    /// Like [`check`](Self::check), but a rejection becomes
    /// `RouteError::BudgetExceeded`.
    pub fn check_result(&self, request: &BudgetRequest) -> RouteResult<BudgetDecision> {
        let decision = self.check(request);
        match decision.error.clone() {
            Some(rejection) => Err(RouteError::BudgetExceeded(rejection)),
            None => Ok(decision),
        }
    }

    fn substitute_or_reject(&self, request: &BudgetRequest, limit: BudgetLimit, ceiling: f64) -> BudgetDecision {
        let alternative = request
            .alternative
            .as_ref()
            .filter(|alt| alt.arm != request.arm);

        if let Some(alt) = alternative {
            let cost = self
                .estimator
                .as_ref()
                .and_then(|estimator| estimator.projected_cost(&request.payload, &alt.arm))
                .unwrap_or(alt.projected_cost);

            let affordable = cost.is_finite()
                && cost >= 0.0
                && cost <= ceiling
                && self
                    .tracker
                    .can_charge(&request.tenant, &request.task_type, cost);
            if affordable {
                metrics::counter!("routewise.budget.substituted").increment(1);
                info!(
                    tenant = %request.tenant,
                    task_type = %request.task_type,
                    from = %request.arm,
                    to = %alt.arm,
                    %limit,
                    cost,
                    "budget substitution"
                );
                return BudgetDecision::substitute(&alt.arm, cost);
            }
        }

        let rejection = BudgetRejection {
            tenant: request.tenant.clone(),
            task_type: request.task_type.clone(),
            arm: request.arm.clone(),
            projected_cost: request.projected_cost,
            limit,
            ceiling: Some(ceiling),
            attempted_alternative: alternative.map(|alt| alt.arm.clone()),
            context: request.context.clone(),
        };
        metrics::counter!("routewise.budget.rejected").increment(1);
        warn!(
            tenant = %rejection.tenant,
            task_type = %rejection.task_type,
            arm = %rejection.arm,
            %limit,
            "budget rejected"
        );
        if let Some(feedback) = &self.feedback {
            feedback.budget_rejected(&rejection);
        }
        BudgetDecision::reject(rejection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::InMemorySpendTracker;
    use parking_lot::Mutex;

    fn enforcer_with(tracker: &InMemorySpendTracker) -> BudgetEnforcer {
        BudgetEnforcer::new(BudgetConfig::default(), Arc::new(tracker.clone()))
    }

    #[derive(Default)]
    struct Recorder {
        rejections: Mutex<Vec<BudgetRejection>>,
    }

    impl BudgetFeedback for Recorder {
        fn budget_rejected(&self, rejection: &BudgetRejection) {
            self.rejections.lock().push(rejection.clone());
        }
    }

    struct FlatEstimator(f64);

    impl CostEstimator for FlatEstimator {
        fn projected_cost(&self, _payload: &serde_json::Value, _arm: &str) -> Option<f64> {
            Some(self.0)
        }
    }

    #[test]
    fn test_approves_within_limits() {
        let tracker = InMemorySpendTracker::new();
        let decision = enforcer_with(&tracker).check(&BudgetRequest::new("acme", "chat", "small", 0.02));
        assert!(decision.approved);
        assert_eq!(decision.final_arm.as_deref(), Some("small"));
        assert!(decision.substituted_arm.is_none());
    }

    #[test]
    fn test_cumulative_exhaustion_substitutes_cheaper_arm() {
        let tracker = InMemorySpendTracker::new();
        tracker.set_budget("acme", "chat", 1.0);
        tracker.record_spend("acme", "chat", 0.95);

        let request = BudgetRequest::new("acme", "chat", "large", 0.10).with_alternative("small", 0.04);
        let decision = enforcer_with(&tracker).check(&request);
        assert!(decision.approved);
        assert_eq!(decision.substituted_arm.as_deref(), Some("small"));
        assert_eq!(decision.final_cost, Some(0.04));
        // The enforcer never charges.
        assert!((tracker.spent("acme", "chat") - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_rejection_notifies_feedback() {
        let tracker = InMemorySpendTracker::new();
        tracker.set_budget("acme", "chat", 0.01);
        let recorder = Arc::new(Recorder::default());
        let enforcer = enforcer_with(&tracker).with_feedback(recorder.clone());

        let request = BudgetRequest::new("acme", "chat", "large", 0.10).with_alternative("small", 0.04);
        let decision = enforcer.check(&request);
        assert!(!decision.approved);
        let rejection = decision.error.unwrap();
        assert_eq!(rejection.limit, BudgetLimit::Cumulative);
        assert_eq!(rejection.attempted_alternative.as_deref(), Some("small"));
        assert_eq!(recorder.rejections.lock().len(), 1);

        let premium = Context::new().with("premium", true);
        enforcer.check(&request.clone().with_context(premium.clone()));
        assert_eq!(recorder.rejections.lock()[1].context, premium);

        assert!(matches!(
            enforcer.check_result(&request),
            Err(RouteError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn test_never_approves_above_ceiling() {
        let tracker = InMemorySpendTracker::new();
        let enforcer = enforcer_with(&tracker);
        for (cost, alt_cost) in [(0.6, 0.7), (0.9, 0.51), (1.0, f64::NAN), (0.55, 0.5)] {
            let request = BudgetRequest::new("acme", "chat", "large", cost).with_alternative("medium", alt_cost);
            let decision = enforcer.check(&request);
            if decision.approved {
                assert!(decision.final_cost.unwrap() <= 0.50);
            }
        }
        let decision = enforcer.check(&BudgetRequest::new("acme", "chat", "large", 0.6));
        assert!(!decision.approved);
        assert_eq!(decision.error.unwrap().limit, BudgetLimit::PerRequest);
    }

    #[test]
    fn test_ceiling_override_and_estimator() {
        let tracker = InMemorySpendTracker::new();
        let enforcer = enforcer_with(&tracker).with_estimator(Arc::new(FlatEstimator(0.2)));

        // Alternative advertised at 0.01 but re-estimated at 0.2, above the 0.1 override.
        let request = BudgetRequest::new("acme", "chat", "large", 0.3)
            .with_ceiling(0.1)
            .with_alternative("small", 0.01);
        assert!(!enforcer.check(&request).approved);

        let request = BudgetRequest::new("acme", "chat", "large", 0.3)
            .with_ceiling(0.25)
            .with_alternative("small", 0.01);
        let decision = enforcer.check(&request);
        assert_eq!(decision.substituted_arm.as_deref(), Some("small"));
        assert_eq!(decision.final_cost, Some(0.2));
    }

    #[test]
    fn test_invalid_projected_cost_is_rejected() {
        let tracker = InMemorySpendTracker::new();
        let decision = enforcer_with(&tracker).check(&BudgetRequest::new("acme", "chat", "large", f64::NAN));
        assert!(!decision.approved);
    }
}
