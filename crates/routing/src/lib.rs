//! Tenant-aware routing on top of the learning engine: permission filtering,
//! deterministic fallback, budget admission and outcome feedback.

pub mod feedback;
pub mod permissions;
pub mod router;
pub mod strategy;

pub use feedback::LearningFeedback;
pub use permissions::{PermissionRegistry, StaticPermissionRegistry};
pub use router::{AdaptiveRouter, RouteRequest, RoutingDecision};
pub use strategy::{BanditStrategy, Selection};
