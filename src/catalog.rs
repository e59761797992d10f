//! Host catalog boundary
//!
//! The catalog is an external collaborator: it owns host persistence and
//! hands the engine immutable `HostConfig` snapshots. Chains reference
//! hosts by id and are re-looked-up on every connection attempt, so
//! catalog edits take effect on the next retry.

use dashmap::DashMap;

use crate::config::{HostConfig, HostId};

/// Read-only view of the host catalog
pub trait HostCatalog: Send + Sync + 'static {
    /// Look up a host by id, returning an immutable snapshot
    fn get(&self, id: &HostId) -> Option<HostConfig>;
}

/// In-memory catalog implementation
///
/// Suitable for tests and for hosts kept by an application-level store
/// that syncs into the engine.
#[derive(Default)]
pub struct MemoryCatalog {
    hosts: DashMap<HostId, HostConfig>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, config: HostConfig) {
        self.hosts.insert(config.id.clone(), config);
    }

    pub fn remove(&self, id: &HostId) -> Option<HostConfig> {
        self.hosts.remove(id).map(|(_, config)| config)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Snapshot of all hosts, for UI listings
    pub fn all(&self) -> Vec<HostConfig> {
        self.hosts.iter().map(|e| e.value().clone()).collect()
    }
}

impl HostCatalog for MemoryCatalog {
    fn get(&self, id: &HostId) -> Option<HostConfig> {
        self.hosts.get(id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMethod, ConnectionKind, RetryPolicy};

    fn host(id: &str) -> HostConfig {
        HostConfig {
            id: id.into(),
            label: None,
            host: format!("{}.example.com", id),
            port: 22,
            username: "user".to_string(),
            kind: ConnectionKind::Shell,
            auth: AuthMethod::Agent,
            chain: vec![],
            keepalive_interval_ms: 30_000,
            retry: RetryPolicy::default(),
            working_dir: None,
        }
    }

    #[test]
    fn insert_and_lookup() {
        let catalog = MemoryCatalog::new();
        catalog.insert(host("h1"));

        let found = catalog.get(&"h1".into()).unwrap();
        assert_eq!(found.host, "h1.example.com");
        assert!(catalog.get(&"h2".into()).is_none());
    }

    #[test]
    fn remove_takes_effect_immediately() {
        let catalog = MemoryCatalog::new();
        catalog.insert(host("h1"));
        catalog.remove(&"h1".into());
        assert!(catalog.get(&"h1".into()).is_none());
    }
}
