//! `BanditStrategy` narrows the learning engine to one domain and one tenant,
//! and owns the single recovery rule: on any selection failure, serve the first
//! candidate the caller offered.

use crate::permissions::{filter_permitted, PermissionRegistry};
use routewise_core::{Context, RouteError, RouteResult};
use routewise_rl_engine::{DomainSnapshot, LearningEngine, PolicyState, RecordStatus, RestoreReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub arm: String,
    /// Candidates left after permission filtering.
    pub permitted: Vec<String>,
    /// `true` when the policy failed and the first original candidate was used.
    pub fallback: bool,
}

#[derive(Clone)]
pub struct BanditStrategy {
    engine: Arc<LearningEngine>,
    domain: String,
    tenant: Option<String>,
    permissions: Option<Arc<dyn PermissionRegistry>>,
}

impl BanditStrategy {
    /// Registers `domain` with the engine's default policy if it is new.
    pub fn new(engine: Arc<LearningEngine>, domain: &str) -> Self {
        engine.ensure_domain(domain);
        Self {
            engine,
            domain: domain.to_string(),
            tenant: None,
            permissions: None,
        }
    }

    pub fn with_tenant(mut self, tenant: &str) -> Self {
        self.tenant = Some(tenant.to_string());
        self
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionRegistry>) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn permitted(&self, candidates: &[String]) -> Vec<String> {
        filter_permitted(self.permissions.as_deref(), self.tenant.as_deref(), candidates)
    }

    pub fn select(&self, context: &Context, candidates: &[String]) -> RouteResult<String> {
        self.select_detailed(context, candidates).map(|s| s.arm)
    }

    /// Errors only when `candidates` is empty; every other failure degrades
    /// to `candidates[0]`.
    pub fn select_detailed(&self, context: &Context, candidates: &[String]) -> RouteResult<Selection> {
        let Some(first) = candidates.first() else {
            return Err(RouteError::validation(format!(
                "select for '{}' needs at least one candidate",
                self.domain
            )));
        };
        let permitted = self.permitted(candidates);

        match self.engine.recommend(&self.domain, context, &permitted) {
            Ok(arm) => Ok(Selection {
                arm,
                permitted,
                fallback: false,
            }),
            Err(err) => {
                warn!(
                    domain = %self.domain,
                    tenant = ?self.tenant,
                    error = %err,
                    fallback = %first,
                    "selection failed; serving first candidate"
                );
                metrics::counter!("routewise.strategy.fallbacks").increment(1);
                Ok(Selection {
                    arm: first.clone(),
                    permitted,
                    fallback: true,
                })
            }
        }
    }

    pub fn update_reward(&self, context: &Context, arm: &str, reward: f64) -> RouteResult<RecordStatus> {
        self.engine.record(&self.domain, context, arm, reward)
    }

    pub fn get_policy_status(&self) -> PolicyState {
        self.engine.domain_status(&self.domain).unwrap_or_default()
    }

    pub fn snapshot_policy(&self) -> Option<DomainSnapshot> {
        self.engine.snapshot_domain(&self.domain)
    }

    pub fn restore_policy(&self, state: DomainSnapshot) -> RestoreReport {
        self.engine.restore_domain(&self.domain, state)
    }
}
