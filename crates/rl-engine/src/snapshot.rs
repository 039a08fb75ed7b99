//! Versioned, serialisable learning state.
//!
//! Wire format: a JSON object keyed by domain name. Each entry is
//! `{"version": 1, "policy": {...}, "q_values": {arm: q}, "counts": {arm: n}, ...}`
//! with policy-specific fields (`alphas`/`betas` for Thompson sampling,
//! `a_diag`/`b` for contextual LinUCB) present only when non-empty.
//! `policy` may be absent; such an entry can only restore into a domain that
//! is already registered.

use crate::bandits::BanditAlgorithm;
use routewise_core::RouteResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Highest snapshot version this build can restore.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<BanditAlgorithm>,
    pub q_values: BTreeMap<String, f64>,
    pub counts: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub alphas: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub betas: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub a_diag: BTreeMap<String, Vec<f64>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub b: BTreeMap<String, Vec<f64>>,
}

impl DomainSnapshot {
    pub fn new(policy: BanditAlgorithm) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            policy: Some(policy),
            q_values: BTreeMap::new(),
            counts: BTreeMap::new(),
            alphas: BTreeMap::new(),
            betas: BTreeMap::new(),
            a_diag: BTreeMap::new(),
            b: BTreeMap::new(),
        }
    }

    /// Arms present in either `q_values` or `counts`.
    pub fn arms(&self) -> Vec<String> {
        let mut arms: Vec<String> = self.q_values.keys().cloned().collect();
        for arm in self.counts.keys() {
            if !self.q_values.contains_key(arm) {
                arms.push(arm.clone());
            }
        }
        arms
    }
}

/// A domain entry as read from disk. Entries written by a newer build may not
/// match today's layout; they are kept opaque so the rest of the snapshot
/// still loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotEntry {
    Domain(DomainSnapshot),
    Opaque(serde_json::Value),
}

impl SnapshotEntry {
    pub fn version(&self) -> Option<u32> {
        match self {
            SnapshotEntry::Domain(d) => Some(d.version),
            SnapshotEntry::Opaque(v) => v
                .get("version")
                .and_then(|v| v.as_u64())
                .and_then(|v| u32::try_from(v).ok()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub domains: BTreeMap<String, SnapshotEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, domain: impl Into<String>, state: DomainSnapshot) {
        self.domains
            .insert(domain.into(), SnapshotEntry::Domain(state));
    }

    pub fn get(&self, domain: &str) -> Option<&DomainSnapshot> {
        match self.domains.get(domain)? {
            SnapshotEntry::Domain(d) => Some(d),
            SnapshotEntry::Opaque(_) => None,
        }
    }

    pub fn get_mut(&mut self, domain: &str) -> Option<&mut DomainSnapshot> {
        match self.domains.get_mut(domain)? {
            SnapshotEntry::Domain(d) => Some(d),
            SnapshotEntry::Opaque(_) => None,
        }
    }

    /// Remove and return one domain's state.
    pub fn take(&mut self, domain: &str) -> Option<DomainSnapshot> {
        match self.domains.remove(domain)? {
            SnapshotEntry::Domain(d) => Some(d),
            SnapshotEntry::Opaque(_) => None,
        }
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.domains.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn to_json(&self) -> RouteResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> RouteResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Outcome of a restore: which domains were replaced and which were left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    pub skipped: Vec<String>,
    pub warnings: Vec<String>,
}

impl RestoreReport {
    pub(crate) fn skip(&mut self, domain: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(domain, reason = %reason, "skipping domain during restore");
        self.skipped.push(domain.to_string());
        self.warnings.push(format!("{domain}: {reason}"));
    }
}
