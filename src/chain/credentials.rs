//! Ephemeral credential material
//!
//! Inline key material is written to a private temp path for the duration
//! of one connect attempt. The set is owned by the resolver call that
//! created it, cleaned up on every outcome, and never shared across
//! attempts.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::HostId;
use crate::error::ChainError;

/// Set of materialized credential files for one resolution call
///
/// Cleanup is idempotent and safe to call multiple times; dropping the set
/// cleans up as a last resort.
#[derive(Debug, Default)]
pub struct CredentialSet {
    files: Mutex<Vec<(HostId, NamedTempFile)>>,
    cleaned: AtomicBool,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write key material to a private temp file and record it for cleanup.
    ///
    /// Returns the path the backend should read the key from. The file is
    /// created with owner-only permissions (0600 on unix, via tempfile).
    pub fn materialize_key(&self, host: &HostId, key_data: &str) -> Result<PathBuf, ChainError> {
        if key_data.trim().is_empty() {
            return Err(ChainError::CredentialMaterialization {
                host: host.clone(),
                cause: "empty key material".to_string(),
            });
        }

        let mut file = tempfile::Builder::new()
            .prefix(&format!("hoplink-key-{}-", host))
            .rand_bytes(12)
            .tempfile()
            .map_err(|e| ChainError::CredentialMaterialization {
                host: host.clone(),
                cause: format!("temp file creation failed: {}", e),
            })?;

        file.write_all(key_data.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| ChainError::CredentialMaterialization {
                host: host.clone(),
                cause: format!("write failed: {}", e),
            })?;

        let path = file.path().to_path_buf();
        debug!("Materialized key for {} at {}", host, path.display());
        self.files.lock().push((host.clone(), file));
        Ok(path)
    }

    /// Destroy all materialized files. Idempotent.
    pub fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut files = self.files.lock();
        for (host, file) in files.drain(..) {
            let path = file.path().to_path_buf();
            match file.close() {
                Ok(()) => debug!("Removed key material for {} at {}", host, path.display()),
                Err(e) => warn!(
                    "Failed to remove key material for {} at {}: {}",
                    host,
                    path.display(),
                    e
                ),
            }
        }
    }

    /// Number of files currently materialized
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl Drop for CredentialSet {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_creates_file_with_content() {
        let set = CredentialSet::new();
        let path = set
            .materialize_key(&"h1".into(), "-----BEGIN KEY-----\nabc\n")
            .unwrap();

        assert!(path.exists());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("-----BEGIN KEY-----"));

        set.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let set = CredentialSet::new();
        let path = set.materialize_key(&"h1".into(), "key").unwrap();

        set.cleanup();
        set.cleanup();
        set.cleanup();
        assert!(!path.exists());
        assert!(set.is_empty());
    }

    #[test]
    fn drop_cleans_up() {
        let path = {
            let set = CredentialSet::new();
            set.materialize_key(&"h1".into(), "key").unwrap()
        };
        assert!(!path.exists());
    }

    #[test]
    fn empty_key_material_is_rejected() {
        let set = CredentialSet::new();
        let err = set.materialize_key(&"h1".into(), "  \n").unwrap_err();
        assert!(matches!(
            err,
            ChainError::CredentialMaterialization { .. }
        ));
        assert!(set.is_empty());
    }
}
