pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::AppConfig;
pub use error::{RouteError, RouteResult};
pub use types::{BudgetDecision, BudgetLimit, BudgetRejection, Context, ContextValue, Outcome, RewardBreakdown};
