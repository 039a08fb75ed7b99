use dashmap::DashMap;
use std::sync::Arc;

/// Source of per-tenant allow-lists.
pub trait PermissionRegistry: Send + Sync {
    /// Arms the tenant may use, or `None` when the tenant is unrestricted.
    fn allowed_models(&self, tenant: &str) -> Option<Vec<String>>;
}

/// In-memory allow-lists.
#[derive(Clone, Default)]
pub struct StaticPermissionRegistry {
    allowed: Arc<DashMap<String, Vec<String>>>,
}

impl StaticPermissionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, tenant: &str, models: &[&str]) {
        self.allowed.insert(
            tenant.to_string(),
            models.iter().map(|m| m.to_string()).collect(),
        );
    }

    pub fn revoke(&self, tenant: &str) -> bool {
        self.allowed.remove(tenant).is_some()
    }
}

impl PermissionRegistry for StaticPermissionRegistry {
    fn allowed_models(&self, tenant: &str) -> Option<Vec<String>> {
        self.allowed.get(tenant).map(|models| models.clone())
    }
}

/// Keep `candidates` the tenant may use, preserving order. A missing registry,
/// tenant or allow-list leaves the list unchanged.
pub fn filter_permitted(
    registry: Option<&dyn PermissionRegistry>,
    tenant: Option<&str>,
    candidates: &[String],
) -> Vec<String> {
    let allowed = match (registry, tenant) {
        (Some(registry), Some(tenant)) => registry.allowed_models(tenant),
        _ => None,
    };
    match allowed {
        Some(allowed) => candidates
            .iter()
            .filter(|c| allowed.contains(c))
            .cloned()
            .collect(),
        None => candidates.to_vec(),
    }
}
