use serde::Deserialize;
use std::collections::HashMap;

/// Root configuration. Loaded from an optional `routewise.toml` file and
/// environment variables with the prefix `ROUTEWISE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub reward: RewardConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LearningConfig {
    /// Global learning switch. When off, `record` never mutates state.
    #[serde(default = "default_learning_enabled")]
    pub enabled: bool,
    /// One of `epsilon_greedy`, `ucb1`, `thompson_sampling`, `contextual_lin_ucb`.
    #[serde(default = "default_policy")]
    pub default_policy: String,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_linucb_alpha")]
    pub linucb_alpha: f64,
    #[serde(default)]
    pub linucb_features: Vec<String>,
    #[serde(default = "default_reward_floor")]
    pub reward_floor: f64,
    #[serde(default = "default_reward_ceiling")]
    pub reward_ceiling: f64,
    /// Fixed RNG seed for reproducible exploration.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub disabled_domains: Vec<String>,
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewardConfig {
    #[serde(default = "default_signal_weights")]
    pub signal_weights: HashMap<String, f64>,
    /// Penalty per USD spent.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    /// Penalty per millisecond of latency.
    #[serde(default = "default_latency_weight")]
    pub latency_weight: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_request_ceiling_usd")]
    pub default_request_ceiling_usd: f64,
    #[serde(default)]
    pub tenant_ceilings: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Weight given to a shadow's own estimate when its pick differs from
    /// production; the remainder comes from the running baseline.
    #[serde(default = "default_blend_factor")]
    pub blend_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_outstanding_trials")]
    pub max_outstanding_trials: usize,
    /// Trials never observed within this window are dropped.
    #[serde(default = "default_trial_ttl_secs")]
    pub trial_ttl_secs: u64,
}

// Default functions
fn default_learning_enabled() -> bool {
    true
}
fn default_policy() -> String {
    "thompson_sampling".to_string()
}
fn default_epsilon() -> f64 {
    0.1
}
fn default_linucb_alpha() -> f64 {
    1.0
}
fn default_reward_floor() -> f64 {
    -1.0
}
fn default_reward_ceiling() -> f64 {
    1.0
}
fn default_signal_weights() -> HashMap<String, f64> {
    HashMap::from([
        ("quality".to_string(), 1.0),
        ("groundedness".to_string(), 0.5),
    ])
}
fn default_cost_weight() -> f64 {
    10.0
}
fn default_latency_weight() -> f64 {
    0.0001
}
fn default_request_ceiling_usd() -> f64 {
    0.50
}
fn default_blend_factor() -> f64 {
    0.5
}
fn default_max_outstanding_trials() -> usize {
    10_000
}
fn default_trial_ttl_secs() -> u64 {
    600
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: default_learning_enabled(),
            default_policy: default_policy(),
            epsilon: default_epsilon(),
            linucb_alpha: default_linucb_alpha(),
            linucb_features: Vec::new(),
            reward_floor: default_reward_floor(),
            reward_ceiling: default_reward_ceiling(),
            seed: None,
            disabled_domains: Vec::new(),
            snapshot_path: None,
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            signal_weights: default_signal_weights(),
            cost_weight: default_cost_weight(),
            latency_weight: default_latency_weight(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_request_ceiling_usd: default_request_ceiling_usd(),
            tenant_ceilings: HashMap::new(),
        }
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            blend_factor: default_blend_factor(),
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_outstanding_trials: default_max_outstanding_trials(),
            trial_ttl_secs: default_trial_ttl_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            learning: LearningConfig::default(),
            reward: RewardConfig::default(),
            budget: BudgetConfig::default(),
            shadow: ShadowConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl BudgetConfig {
    /// Effective per-request ceiling: the minimum of the global default, the
    /// tenant override and the per-call override, whichever are present.
    pub fn effective_ceiling(&self, tenant: &str, call_override: Option<f64>) -> f64 {
        let mut ceiling = self.default_request_ceiling_usd;
        if let Some(tenant_ceiling) = self.tenant_ceilings.get(tenant) {
            ceiling = ceiling.min(*tenant_ceiling);
        }
        if let Some(over) = call_override {
            ceiling = ceiling.min(over);
        }
        ceiling
    }
}

impl AppConfig {
    /// Load configuration from `routewise.toml` (if present) and environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from("routewise")
    }

    /// Load configuration from the named file (extension optional, may be absent)
    /// overlaid with `ROUTEWISE__*` environment variables.
    pub fn load_from(file: &str) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(file).required(false))
            .add_source(
                config::Environment::with_prefix("ROUTEWISE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
