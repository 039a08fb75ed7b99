//! Budget admission control: cumulative spend accounts per (tenant, task type)
//! and a per-request cost ceiling, enforced with at most one substitution.

pub mod enforcer;
pub mod tracker;

pub use enforcer::{Alternative, BudgetEnforcer, BudgetFeedback, BudgetRequest, CostEstimator};
pub use tracker::{InMemorySpendTracker, SpendAccount, SpendTracker};
