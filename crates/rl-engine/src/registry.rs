//! Thread-safe domain → policy store.
//!
//! Each domain's policy sits behind its own mutex; the map itself is behind a
//! read/write lock. Per-domain operations hold the read guard for their whole
//! duration, so `restore` (write guard) never interleaves with a `record`.

use crate::bandits::{BanditAlgorithm, BanditPolicy};
use crate::snapshot::{RestoreReport, Snapshot, SnapshotEntry, SNAPSHOT_VERSION};
use crate::state::PolicyState;
use parking_lot::{Mutex, RwLock};
use routewise_core::RouteError;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

struct DomainSlot {
    policy: Mutex<BanditPolicy>,
    learning_enabled: AtomicBool,
}

impl DomainSlot {
    fn new(policy: BanditPolicy, learning_enabled: bool) -> Self {
        Self {
            policy: Mutex::new(policy),
            learning_enabled: AtomicBool::new(learning_enabled),
        }
    }
}

pub struct PolicyRegistry {
    domains: RwLock<BTreeMap<String, DomainSlot>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register `policy` under `domain`. Returns `false` (and drops `policy`)
    /// if the domain already exists.
    pub fn register(&self, domain: &str, policy: BanditPolicy, learning_enabled: bool) -> bool {
        let mut domains = self.domains.write();
        if domains.contains_key(domain) {
            debug!(domain, "domain already registered");
            return false;
        }
        info!(domain, policy = policy.kind(), learning_enabled, "domain registered");
        domains.insert(domain.to_string(), DomainSlot::new(policy, learning_enabled));
        true
    }

    pub fn unregister(&self, domain: &str) -> bool {
        let removed = self.domains.write().remove(domain).is_some();
        if removed {
            info!(domain, "domain unregistered");
        }
        removed
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.domains.read().contains_key(domain)
    }

    pub fn domains(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.domains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }

    /// Run `f` with exclusive access to the domain's policy.
    pub fn with_policy<R>(&self, domain: &str, f: impl FnOnce(&mut BanditPolicy) -> R) -> Option<R> {
        let domains = self.domains.read();
        let slot = domains.get(domain)?;
        let mut policy = slot.policy.lock();
        Some(f(&mut policy))
    }

    pub fn learning_enabled(&self, domain: &str) -> Option<bool> {
        self.domains
            .read()
            .get(domain)
            .map(|slot| slot.learning_enabled.load(Ordering::Acquire))
    }

    pub fn set_learning_enabled(&self, domain: &str, enabled: bool) -> bool {
        match self.domains.read().get(domain) {
            Some(slot) => {
                slot.learning_enabled.store(enabled, Ordering::Release);
                info!(domain, enabled, "domain learning toggled");
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> BTreeMap<String, PolicyState> {
        let domains = self.domains.read();
        domains
            .iter()
            .map(|(name, slot)| (name.clone(), slot.policy.lock().status()))
            .collect()
    }

    /// Consistent snapshot of every domain: all domain locks are held at once,
    /// acquired in name order.
    pub fn snapshot(&self) -> Snapshot {
        let domains = self.domains.read();
        let guards: Vec<_> = domains
            .iter()
            .map(|(name, slot)| (name, slot.policy.lock()))
            .collect();

        let mut snapshot = Snapshot::new();
        for (name, policy) in &guards {
            snapshot.insert(name.as_str(), policy.snapshot());
        }
        snapshot
    }

    /// Replace state for every domain in `snapshot` under the registry write
    /// lock. Unknown domains are created through `factory`, which returns the
    /// new policy and its initial learning flag.
    pub fn restore(
        &self,
        snapshot: &Snapshot,
        factory: impl Fn(&str, &BanditAlgorithm) -> (BanditPolicy, bool),
    ) -> RestoreReport {
        let mut report = RestoreReport::default();
        let mut domains = self.domains.write();

        for (name, entry) in &snapshot.domains {
            match entry.version() {
                Some(version) if (1..=SNAPSHOT_VERSION).contains(&version) => {}
                Some(version) => {
                    let err = RouteError::SnapshotVersion {
                        domain: name.clone(),
                        found: version,
                        supported: SNAPSHOT_VERSION,
                    };
                    report.skip(name, err.to_string());
                    continue;
                }
                None => {
                    report.skip(name, "entry has no readable version");
                    continue;
                }
            }
            let state = match entry {
                SnapshotEntry::Domain(state) => state,
                SnapshotEntry::Opaque(_) => {
                    report.skip(name, "entry layout is not recognised");
                    continue;
                }
            };

            match domains.get(name) {
                Some(slot) => {
                    let mut policy = slot.policy.lock();
                    match policy.restore(state) {
                        Ok(()) => report.restored.push(name.clone()),
                        Err(err) => report.skip(name, err.to_string()),
                    }
                }
                None => {
                    let Some(algorithm) = &state.policy else {
                        report.skip(name, "domain is not registered and the entry names no policy");
                        continue;
                    };
                    if let Err(err) = algorithm.validate() {
                        report.skip(name, err.to_string());
                        continue;
                    }
                    let (mut policy, learning_enabled) = factory(name, algorithm);
                    match policy.restore(state) {
                        Ok(()) => {
                            info!(domain = %name, policy = policy.kind(), "domain created from snapshot");
                            domains.insert(name.clone(), DomainSlot::new(policy, learning_enabled));
                            report.restored.push(name.clone());
                        }
                        Err(err) => report.skip(name, err.to_string()),
                    }
                }
            }
        }

        info!(
            restored = report.restored.len(),
            skipped = report.skipped.len(),
            "snapshot restored"
        );
        report
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
