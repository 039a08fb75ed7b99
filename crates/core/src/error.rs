use crate::types::BudgetRejection;
use thiserror::Error;

pub type RouteResult<T> = Result<T, RouteError>;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(BudgetRejection),

    #[error("Snapshot version error: domain '{domain}' has version {found}, supported up to {supported}")]
    SnapshotVersion {
        domain: String,
        found: u32,
        supported: u32,
    },

    #[error("Policy failure in domain '{domain}': {reason}")]
    PolicyFailure { domain: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RouteError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn policy_failure(domain: &str, reason: impl std::fmt::Display) -> Self {
        Self::PolicyFailure {
            domain: domain.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short machine-readable label, used as a metrics/log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::SnapshotVersion { .. } => "snapshot_version",
            Self::PolicyFailure { .. } => "policy_failure",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for RouteError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
