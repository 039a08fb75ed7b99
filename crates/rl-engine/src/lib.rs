//! Online learning engine: multi-armed bandits (Epsilon-Greedy, UCB1,
//! Thompson Sampling), diagonal contextual LinUCB, reward computation,
//! snapshot/restore, shadow evaluation and the optional adaptive optimiser loop.

pub mod adaptive;
pub mod bandits;
pub mod contextual;
pub mod engine;
pub mod registry;
pub mod reward;
pub mod shadow;
pub mod snapshot;
pub mod state;

pub use adaptive::{AdaptiveRoutingManager, Suggestion, SuggestionOptimizer};
pub use bandits::{BanditAlgorithm, BanditPolicy};
pub use contextual::ContextualLinUcb;
pub use engine::{BakeoffReport, LearningEngine, RecordStatus};
pub use registry::PolicyRegistry;
pub use reward::{RewardEngine, RewardWeights, WeightOverrides};
pub use shadow::{ShadowRecord, ShadowRegretTracker, ShadowReport};
pub use snapshot::{DomainSnapshot, RestoreReport, Snapshot, SnapshotEntry, SNAPSHOT_VERSION};
pub use state::{ArmState, PolicyError, PolicyState};
