use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single context feature: numeric, categorical, or a boolean flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Number(f64),
    Flag(bool),
    Category(String),
}

impl ContextValue {
    /// Numeric encoding used by contextual policies. Categories map to a
    /// stable bucket in `[0, 1)` so the same label always encodes the same way.
    pub fn as_feature(&self) -> f64 {
        match self {
            ContextValue::Number(v) => *v,
            ContextValue::Flag(true) => 1.0,
            ContextValue::Flag(false) => 0.0,
            ContextValue::Category(label) => (stable_hash(label) % 1000) as f64 / 1000.0,
        }
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Number(v)
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Flag(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::Category(v.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::Category(v)
    }
}

/// Ordered feature map describing the decision situation. Policies only read it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    features: BTreeMap<String, ContextValue>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.features.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ContextValue>) {
        self.features.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ContextValue> {
        self.features.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextValue)> {
        self.features.iter()
    }

    /// Project the context onto a fixed feature layout. Missing features encode
    /// as 0.0; a trailing constant 1.0 is appended when `bias` is set.
    pub fn feature_vector(&self, names: &[String], bias: bool) -> Array1<f64> {
        let dim = names.len() + usize::from(bias);
        let mut x = Array1::<f64>::zeros(dim);
        for (i, name) in names.iter().enumerate() {
            x[i] = self.get(name).map(ContextValue::as_feature).unwrap_or(0.0);
        }
        if bias {
            x[dim - 1] = 1.0;
        }
        x
    }
}

/// Outcome reported by the calling layer after a candidate has executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub cost_usd: f64,
    pub latency_ms: f64,
    /// Named quality signals, e.g. `quality`, `groundedness`.
    #[serde(default)]
    pub signals: BTreeMap<String, f64>,
}

impl Outcome {
    pub fn new(cost_usd: f64, latency_ms: f64) -> Self {
        Self {
            cost_usd,
            latency_ms,
            signals: BTreeMap::new(),
        }
    }

    pub fn with_signal(mut self, name: impl Into<String>, value: f64) -> Self {
        self.signals.insert(name.into(), value);
        self
    }
}

/// Weighted reward with its signed components. Quality components are
/// positive contributions; `cost` and `latency` are stored negated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub total: f64,
    pub components: BTreeMap<String, f64>,
}

impl RewardBreakdown {
    /// A zero reward tagged with a single explanatory component.
    pub fn zero(tag: &str) -> Self {
        let mut components = BTreeMap::new();
        components.insert(tag.to_string(), 0.0);
        Self {
            total: 0.0,
            components,
        }
    }

    pub fn component(&self, name: &str) -> Option<f64> {
        self.components.get(name).copied()
    }
}

/// Which budget limit a proposed charge ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLimit {
    /// The cumulative (tenant, task) spend budget.
    Cumulative,
    /// The effective per-request ceiling.
    PerRequest,
}

impl fmt::Display for BudgetLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetLimit::Cumulative => write!(f, "cumulative budget"),
            BudgetLimit::PerRequest => write!(f, "per-request ceiling"),
        }
    }
}

/// Structured description of a budget rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRejection {
    pub tenant: String,
    pub task_type: String,
    pub arm: String,
    pub projected_cost: f64,
    pub limit: BudgetLimit,
    pub ceiling: Option<f64>,
    /// Alternative that was tried and found unaffordable, if any.
    pub attempted_alternative: Option<String>,
    /// Decision context of the rejected request.
    #[serde(default)]
    pub context: Context,
}

impl fmt::Display for BudgetRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arm '{}' for tenant '{}' task '{}' (${:.4}) exceeds the {}",
            self.arm, self.tenant, self.task_type, self.projected_cost, self.limit
        )?;
        if let Some(alt) = &self.attempted_alternative {
            write!(f, "; alternative '{}' was not affordable", alt)?;
        }
        Ok(())
    }
}

/// Result of a budget admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub approved: bool,
    /// The arm that will actually be served when approved.
    pub final_arm: Option<String>,
    pub final_cost: Option<f64>,
    pub substituted_arm: Option<String>,
    pub error: Option<BudgetRejection>,
}

impl BudgetDecision {
    pub fn approve(arm: &str, cost: f64) -> Self {
        Self {
            approved: true,
            final_arm: Some(arm.to_string()),
            final_cost: Some(cost),
            substituted_arm: None,
            error: None,
        }
    }

    pub fn substitute(arm: &str, cost: f64) -> Self {
        Self {
            approved: true,
            final_arm: Some(arm.to_string()),
            final_cost: Some(cost),
            substituted_arm: Some(arm.to_string()),
            error: None,
        }
    }

    pub fn reject(rejection: BudgetRejection) -> Self {
        Self {
            approved: false,
            final_arm: None,
            final_cost: None,
            substituted_arm: None,
            error: Some(rejection),
        }
    }
}

/// FNV-1a; stable across processes and platforms.
pub fn stable_hash(value: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in value.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
