//! Chain resolution
//!
//! Turns a stored ordered list of jump-host identifiers plus a leaf host
//! into concrete hops the backend can traverse:
//!
//! ```text
//! Client --> [Jump1] --> [Jump2] --> ... --> [JumpN] --> [Leaf]
//! ```
//!
//! Chains are rebuilt on every connection attempt; upstream host configs
//! may change between retries, so a resolved chain is never cached.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::credentials::CredentialSet;
use crate::catalog::HostCatalog;
use crate::config::{AuthMethod, HostConfig, HostId};
use crate::error::ChainError;

/// One resolved node in a connection chain
#[derive(Debug, Clone)]
pub struct Hop {
    /// Catalog id this hop was resolved from
    pub host_id: HostId,
    /// Hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username for authentication
    pub username: String,
    /// Resolved authentication material
    pub auth: HopAuth,
}

/// Authentication material after resolution. Inline key data has been
/// materialized to a path by this point.
#[derive(Debug, Clone)]
pub enum HopAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

/// A fully resolved chain, leaf hop last
///
/// Holds the credential material the backend needs while connecting. The
/// caller cleans the material up once the connect attempt completes,
/// whatever the outcome.
#[derive(Debug)]
pub struct ResolvedChain {
    hops: Vec<Hop>,
    credentials: Arc<CredentialSet>,
}

impl ResolvedChain {
    /// All hops in traversal order; the leaf is always last
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// The final, user-intended destination
    pub fn leaf(&self) -> &Hop {
        self.hops.last().expect("resolved chain is never empty")
    }

    /// Number of hops including the leaf
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Credential material backing this chain
    pub fn credentials(&self) -> Arc<CredentialSet> {
        Arc::clone(&self.credentials)
    }
}

/// Resolves chain identifiers against the host catalog
pub struct ChainResolver {
    catalog: Arc<dyn HostCatalog>,
}

impl ChainResolver {
    pub fn new(catalog: Arc<dyn HostCatalog>) -> Self {
        Self { catalog }
    }

    /// Resolve `chain_ids` strictly left to right, terminating with `leaf`.
    ///
    /// On any failure partway through, all credential material materialized
    /// so far for this call is destroyed before the error is returned.
    pub fn resolve(
        &self,
        chain_ids: &[HostId],
        leaf: &HostConfig,
    ) -> Result<ResolvedChain, ChainError> {
        // A host must not appear more than once, including as the leaf
        let mut seen: HashSet<&HostId> = HashSet::new();
        for id in chain_ids {
            if !seen.insert(id) {
                return Err(ChainError::CycleDetected(id.clone()));
            }
        }
        if seen.contains(&leaf.id) {
            return Err(ChainError::CycleDetected(leaf.id.clone()));
        }

        let credentials = Arc::new(CredentialSet::new());
        let mut hops = Vec::with_capacity(chain_ids.len() + 1);

        for id in chain_ids {
            let config = match self.catalog.get(id) {
                Some(config) => config,
                None => {
                    credentials.cleanup();
                    return Err(ChainError::UnknownHost(id.clone()));
                }
            };
            match Self::resolve_hop(&config, &credentials) {
                Ok(hop) => hops.push(hop),
                Err(e) => {
                    credentials.cleanup();
                    return Err(e);
                }
            }
        }

        match Self::resolve_hop(leaf, &credentials) {
            Ok(hop) => hops.push(hop),
            Err(e) => {
                credentials.cleanup();
                return Err(e);
            }
        }

        debug!(
            "Resolved chain for {}: {} hops, {} materialized keys",
            leaf.id,
            hops.len(),
            credentials.len()
        );

        Ok(ResolvedChain { hops, credentials })
    }

    fn resolve_hop(
        config: &HostConfig,
        credentials: &CredentialSet,
    ) -> Result<Hop, ChainError> {
        let auth = match &config.auth {
            AuthMethod::Password { password } => HopAuth::Password(password.clone()),
            AuthMethod::KeyFile {
                key_path,
                passphrase,
            } => HopAuth::KeyFile {
                path: PathBuf::from(key_path),
                passphrase: passphrase.clone(),
            },
            AuthMethod::KeyData {
                key_data,
                passphrase,
            } => {
                let path = credentials.materialize_key(&config.id, key_data)?;
                HopAuth::KeyFile {
                    path,
                    passphrase: passphrase.clone(),
                }
            }
            AuthMethod::Agent => HopAuth::Agent,
        };

        Ok(Hop {
            host_id: config.id.clone(),
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::{ConnectionKind, RetryPolicy};

    fn host(id: &str, auth: AuthMethod) -> HostConfig {
        HostConfig {
            id: id.into(),
            label: None,
            host: format!("{}.example.com", id),
            port: 22,
            username: "user".to_string(),
            kind: ConnectionKind::Shell,
            auth,
            chain: vec![],
            keepalive_interval_ms: 30_000,
            retry: RetryPolicy::default(),
            working_dir: None,
        }
    }

    fn resolver_with(hosts: Vec<HostConfig>) -> ChainResolver {
        let catalog = MemoryCatalog::new();
        for h in hosts {
            catalog.insert(h);
        }
        ChainResolver::new(Arc::new(catalog))
    }

    #[test]
    fn hops_resolve_in_order_with_leaf_last() {
        let resolver = resolver_with(vec![
            host("h1", AuthMethod::Agent),
            host("h2", AuthMethod::Agent),
        ]);
        let leaf = host("h3", AuthMethod::Agent);

        let chain = resolver
            .resolve(&["h1".into(), "h2".into()], &leaf)
            .unwrap();

        let ids: Vec<&str> = chain.hops().iter().map(|h| h.host_id.as_str()).collect();
        assert_eq!(ids, vec!["h1", "h2", "h3"]);
        assert_eq!(chain.leaf().host_id.as_str(), "h3");
    }

    #[test]
    fn empty_chain_resolves_to_leaf_only() {
        let resolver = resolver_with(vec![]);
        let leaf = host("h1", AuthMethod::password("secret"));

        let chain = resolver.resolve(&[], &leaf).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(matches!(chain.leaf().auth, HopAuth::Password(_)));
    }

    #[test]
    fn unknown_host_aborts_resolution() {
        let resolver = resolver_with(vec![host("h1", AuthMethod::Agent)]);
        let leaf = host("h3", AuthMethod::Agent);

        let err = resolver
            .resolve(&["h1".into(), "missing".into()], &leaf)
            .unwrap_err();
        assert!(matches!(err, ChainError::UnknownHost(id) if id.as_str() == "missing"));
    }

    #[test]
    fn duplicate_hop_is_a_cycle() {
        let resolver = resolver_with(vec![host("h1", AuthMethod::Agent)]);
        let leaf = host("h3", AuthMethod::Agent);

        let err = resolver
            .resolve(&["h1".into(), "h1".into()], &leaf)
            .unwrap_err();
        assert!(matches!(err, ChainError::CycleDetected(_)));
    }

    #[test]
    fn leaf_in_chain_is_a_cycle() {
        let resolver = resolver_with(vec![host("h3", AuthMethod::Agent)]);
        let leaf = host("h3", AuthMethod::Agent);

        let err = resolver.resolve(&["h3".into()], &leaf).unwrap_err();
        assert!(matches!(err, ChainError::CycleDetected(id) if id.as_str() == "h3"));
    }

    #[test]
    fn key_data_hop_materializes_exactly_one_file() {
        let resolver = resolver_with(vec![
            host("h1", AuthMethod::Agent),
            host("h2", AuthMethod::key_data("fake key material", None)),
        ]);
        let leaf = host("h3", AuthMethod::Agent);

        let chain = resolver
            .resolve(&["h1".into(), "h2".into()], &leaf)
            .unwrap();

        let creds = chain.credentials();
        assert_eq!(creds.len(), 1);

        let key_path = match &chain.hops()[1].auth {
            HopAuth::KeyFile { path, .. } => path.clone(),
            other => panic!("expected key file auth, got {:?}", other),
        };
        assert!(key_path.exists());

        creds.cleanup();
        assert!(!key_path.exists());
    }

    #[test]
    fn partial_failure_destroys_earlier_material() {
        // First hop materializes a key, second hop fails to materialize:
        // nothing may leak. Host ids are unique to this test so the temp
        // dir scan below cannot see files from concurrently running tests.
        let resolver = resolver_with(vec![
            host("pf-first", AuthMethod::key_data("valid key", None)),
            host("pf-second", AuthMethod::key_data("", None)),
        ]);
        let leaf = host("pf-leaf", AuthMethod::Agent);

        let err = resolver
            .resolve(&["pf-first".into(), "pf-second".into()], &leaf)
            .unwrap_err();
        assert!(matches!(
            err,
            ChainError::CredentialMaterialization { ref host, .. } if host.as_str() == "pf-second"
        ));

        // The first hop's material was destroyed before the error returned
        let stray = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("hoplink-key-pf-first")
            })
            .count();
        assert_eq!(stray, 0);
    }

    #[test]
    fn catalog_changes_apply_on_next_resolution() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert(host("h1", AuthMethod::Agent));
        let resolver = ChainResolver::new(catalog.clone());
        let leaf = host("h3", AuthMethod::Agent);

        let first = resolver.resolve(&["h1".into()], &leaf).unwrap();
        assert_eq!(first.hops()[0].port, 22);

        let mut updated = host("h1", AuthMethod::Agent);
        updated.port = 2222;
        catalog.insert(updated);

        let second = resolver.resolve(&["h1".into()], &leaf).unwrap();
        assert_eq!(second.hops()[0].port, 2222);
    }
}
