use routewise_budget::BudgetFeedback;
use routewise_core::{BudgetRejection, RewardBreakdown};
use routewise_rl_engine::LearningEngine;
use std::sync::Arc;
use tracing::debug;

pub const BUDGET_REJECTION: &str = "budget_rejection";

/// Turns budget rejections into zero-reward observations for the rejected
/// arm under the request's context, with the task type as the learning
/// domain. Rejected requests never ran, so shadow scoring is not fed.
pub struct LearningFeedback {
    engine: Arc<LearningEngine>,
}

impl LearningFeedback {
    pub fn new(engine: Arc<LearningEngine>) -> Self {
        Self { engine }
    }
}

impl BudgetFeedback for LearningFeedback {
    fn budget_rejected(&self, rejection: &BudgetRejection) {
        let breakdown = RewardBreakdown::zero(BUDGET_REJECTION);
        match self.engine.record_unserved(
            &rejection.task_type,
            &rejection.context,
            &rejection.arm,
            breakdown.total,
        ) {
            Ok(status) => debug!(
                domain = %rejection.task_type,
                arm = %rejection.arm,
                ?status,
                "budget rejection fed back"
            ),
            Err(err) => debug!(
                domain = %rejection.task_type,
                error = %err,
                "budget rejection not recorded"
            ),
        }
    }
}
