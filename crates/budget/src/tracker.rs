//! Cumulative spend accounting keyed by (tenant, task type).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Tolerance for float accumulation when comparing spend against a limit.
const SPEND_EPSILON: f64 = 1e-9;

/// Cumulative budget oracle consulted before a request is admitted.
pub trait SpendTracker: Send + Sync {
    /// Whether charging `cost` keeps the account within its limit.
    fn can_charge(&self, tenant: &str, task_type: &str, cost: f64) -> bool;

    /// Add actual spend after execution.
    fn record_spend(&self, tenant: &str, task_type: &str, cost: f64);

    /// Budget left, or `None` when the account is unlimited.
    fn remaining(&self, tenant: &str, task_type: &str) -> Option<f64>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendAccount {
    /// `None` means unlimited; spend is still tracked.
    pub limit_usd: Option<f64>,
    pub spent_usd: f64,
    pub updated_at: DateTime<Utc>,
}

impl SpendAccount {
    fn unlimited() -> Self {
        Self {
            limit_usd: None,
            spent_usd: 0.0,
            updated_at: Utc::now(),
        }
    }

    fn remaining(&self) -> Option<f64> {
        self.limit_usd.map(|limit| (limit - self.spent_usd).max(0.0))
    }
}

/// In-memory tracker backed by `DashMap`. Each account update happens under
/// its shard lock, so increments for one key never race.
#[derive(Clone, Default)]
pub struct InMemorySpendTracker {
    accounts: Arc<DashMap<(String, String), SpendAccount>>,
}

impl InMemorySpendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_budget(&self, tenant: &str, task_type: &str, limit_usd: f64) {
        self.accounts
            .entry(key(tenant, task_type))
            .and_modify(|account| {
                account.limit_usd = Some(limit_usd);
                account.updated_at = Utc::now();
            })
            .or_insert_with(|| SpendAccount {
                limit_usd: Some(limit_usd),
                ..SpendAccount::unlimited()
            });
        info!(tenant, task_type, limit_usd, "spend budget set");
    }

    pub fn spent(&self, tenant: &str, task_type: &str) -> f64 {
        self.accounts
            .get(&key(tenant, task_type))
            .map(|account| account.spent_usd)
            .unwrap_or(0.0)
    }

    pub fn account(&self, tenant: &str, task_type: &str) -> Option<SpendAccount> {
        self.accounts.get(&key(tenant, task_type)).map(|a| a.clone())
    }

    /// Zero the spend of one account, keeping its limit.
    pub fn reset(&self, tenant: &str, task_type: &str) {
        if let Some(mut account) = self.accounts.get_mut(&key(tenant, task_type)) {
            account.spent_usd = 0.0;
            account.updated_at = Utc::now();
            info!(tenant, task_type, "spend account reset");
        }
    }
}

impl SpendTracker for InMemorySpendTracker {
    fn can_charge(&self, tenant: &str, task_type: &str, cost: f64) -> bool {
        match self.accounts.get(&key(tenant, task_type)) {
            Some(account) => match account.limit_usd {
                Some(limit) => account.spent_usd + cost <= limit + SPEND_EPSILON,
                None => true,
            },
            None => true,
        }
    }

    fn record_spend(&self, tenant: &str, task_type: &str, cost: f64) {
        if !cost.is_finite() || cost <= 0.0 {
            debug!(tenant, task_type, cost, "ignoring non-positive spend");
            return;
        }
        let mut account = self
            .accounts
            .entry(key(tenant, task_type))
            .or_insert_with(SpendAccount::unlimited);
        account.spent_usd += cost;
        account.updated_at = Utc::now();
    }

    fn remaining(&self, tenant: &str, task_type: &str) -> Option<f64> {
        self.accounts
            .get(&key(tenant, task_type))
            .and_then(|account| account.remaining())
    }
}

fn key(tenant: &str, task_type: &str) -> (String, String) {
    (tenant.to_string(), task_type.to_string())
}
