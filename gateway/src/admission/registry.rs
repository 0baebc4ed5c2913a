use std::collections::HashSet;

use dashmap::DashSet;
use log::{debug, info};
use tokio::sync::Mutex;

// Outcome of a reload, for logging and statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

// Set of tenants allowed to use the gateway.
//
// Lookups go to a sharded concurrent set and never wait for each other.
// Reloads are serialized by `applied`, which also remembers the last full
// list so the next reload can be applied as a difference.
pub struct AdmissionRegistry {
    enabled: bool,
    tenants: DashSet<String>,
    applied: Mutex<Vec<String>>,
}

// Items of `a` missing from `b`, first occurrence order, no duplicates.
fn difference(a: &[String], b: &[String]) -> Vec<String> {
    let exclude: HashSet<&String> = b.iter().collect();
    let mut seen: HashSet<&String> = HashSet::new();
    a.iter()
        .filter(|t| !exclude.contains(t) && seen.insert(*t))
        .cloned()
        .collect()
}

impl AdmissionRegistry {

    pub fn new(enabled: bool) -> AdmissionRegistry {
        AdmissionRegistry {
            enabled,
            tenants: DashSet::new(),
            applied: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_admitted(&self, tenant_id: &str) -> bool {
        !self.enabled || self.tenants.contains(tenant_id)
    }

    // Number of admitted tenants.
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    // Apply a full replacement list. Only the difference to the previous
    // list touches the set, so lookups of unaffected tenants never flip.
    pub async fn reload(&self, tenants: Vec<String>) -> ReloadSummary {
        if !self.enabled {
            debug!("admission control disabled, ignoring {} tenants", tenants.len());
            return ReloadSummary::default();
        }

        let mut applied = self.applied.lock().await;

        let added = difference(&tenants, &applied);
        for tenant_id in added.iter() {
            self.tenants.insert(tenant_id.clone());
            info!("tenant {} joined the admission list", tenant_id);
        }

        let removed = difference(&applied, &tenants);
        for tenant_id in removed.iter() {
            self.tenants.remove(tenant_id);
            info!("tenant {} removed from the admission list", tenant_id);
        }

        *applied = tenants;
        debug!("admission list reloaded, {} tenants admitted", self.tenants.len());

        ReloadSummary { added, removed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn disabled_admits_everyone() {
        let registry = AdmissionRegistry::new(false);
        assert!(registry.is_admitted("acme"));
        assert_eq!(registry.reload(names(&["globex"])).await, ReloadSummary::default());
        assert!(registry.is_admitted("anyone"));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn enabled_starts_empty() {
        let registry = AdmissionRegistry::new(true);
        assert!(!registry.is_admitted("acme"));
    }

    #[tokio::test]
    async fn reload_applies_difference() {
        let registry = AdmissionRegistry::new(true);
        let first = registry.reload(names(&["acme", "globex"])).await;
        assert_eq!(first.added, names(&["acme", "globex"]));
        assert!(first.removed.is_empty());

        let second = registry.reload(names(&["globex", "initech"])).await;
        assert_eq!(second.added, names(&["initech"]));
        assert_eq!(second.removed, names(&["acme"]));
        assert!(!registry.is_admitted("acme"));
        assert!(registry.is_admitted("globex"));
        assert!(registry.is_admitted("initech"));

        let again = registry.reload(names(&["globex", "initech"])).await;
        assert_eq!(again, ReloadSummary::default());
    }

    #[tokio::test]
    async fn duplicates_collapse() {
        let registry = AdmissionRegistry::new(true);
        let summary = registry.reload(names(&["acme", "acme", "globex"])).await;
        assert_eq!(summary.added, names(&["acme", "globex"]));
        assert_eq!(registry.len(), 2);

        let summary = registry.reload(names(&["globex"])).await;
        assert_eq!(summary.removed, names(&["acme"]));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn admitted_iff_in_latest_list() {
        let lists: Vec<Vec<String>> = vec![
            names(&[]),
            names(&["a", "b", "c"]),
            names(&["c", "d"]),
            names(&["a"]),
            names(&["a", "a", "e", "b"]),
            names(&[]),
            names(&["d", "e"]),
        ];
        let universe = names(&["a", "b", "c", "d", "e", "f"]);

        // every ordered pair of lists
        for old in lists.iter() {
            for new in lists.iter() {
                let registry = AdmissionRegistry::new(true);
                registry.reload(old.clone()).await;
                registry.reload(new.clone()).await;
                for tenant in universe.iter() {
                    assert_eq!(
                        registry.is_admitted(tenant),
                        new.contains(tenant),
                        "old={:?} new={:?} tenant={}",
                        old,
                        new,
                        tenant
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn concurrent_readers_during_reload() {
        let registry = std::sync::Arc::new(AdmissionRegistry::new(true));
        registry.reload(names(&["stable", "leaving"])).await;

        let mut readers = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    assert!(registry.is_admitted("stable"));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for i in 0..50 {
            let list = if i % 2 == 0 { names(&["stable", "joining"]) } else { names(&["stable", "leaving"]) };
            registry.reload(list).await;
        }
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
