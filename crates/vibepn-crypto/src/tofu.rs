//! Trust-on-first-use pinning store
//!
//! Persistent mapping of peer name to certificate fingerprint, stored as a
//! JSON object in a user-scoped file (directory mode 0700, file mode 0600).
//! The first fingerprint observed for a name is pinned; any later mismatch
//! is rejected without touching the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, info};

use crate::error::{CryptoError, CryptoResult};

/// Persistent peer-name → fingerprint pinning store.
///
/// The file is loaded lazily on first access and cached; one lock covers
/// both the in-memory map and the file write.
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    cache: Mutex<Option<HashMap<String, String>>>,
}

impl TrustStore {
    /// Open the store at the default location, `$HOME/.vibepn/known_peers.json`.
    pub fn open_default() -> CryptoResult<Self> {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| CryptoError::TrustStore("HOME is not set".to_string()))?;
        Ok(Self::at(Path::new(&home).join(".vibepn").join("known_peers.json")))
    }

    /// Open the store at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Check `fingerprint` against the pin for `peer_name`, pinning it if
    /// the name is unknown.
    ///
    /// Returns an error on mismatch; the stored pin is never updated on
    /// mismatch. A persistence failure after a successful first pin is
    /// logged but does not fail the admission.
    pub fn admit(&self, peer_name: &str, fingerprint: &str) -> CryptoResult<()> {
        let mut guard = self.cache.lock().unwrap();
        let map = Self::loaded(&self.path, &mut guard)?;

        match map.get(peer_name) {
            Some(known) if known == fingerprint => {
                info!(peer = peer_name, "verified pinned fingerprint");
                Ok(())
            }
            Some(known) => Err(CryptoError::TrustMismatch {
                peer: peer_name.to_string(),
                expected: known.clone(),
                actual: fingerprint.to_string(),
            }),
            None => {
                info!(peer = peer_name, fingerprint, "pinning first-seen fingerprint");
                map.insert(peer_name.to_string(), fingerprint.to_string());
                if let Err(e) = Self::persist(&self.path, map) {
                    error!(error = %e, "failed to persist trust store");
                }
                Ok(())
            }
        }
    }

    /// The pinned fingerprint for a peer name, if any.
    pub fn get(&self, peer_name: &str) -> CryptoResult<Option<String>> {
        let mut guard = self.cache.lock().unwrap();
        let map = Self::loaded(&self.path, &mut guard)?;
        Ok(map.get(peer_name).cloned())
    }

    fn loaded<'a>(
        path: &Path,
        guard: &'a mut Option<HashMap<String, String>>,
    ) -> CryptoResult<&'a mut HashMap<String, String>> {
        if guard.is_none() {
            let map = match std::fs::read(path) {
                Ok(data) => serde_json::from_slice(&data)
                    .map_err(|e| CryptoError::TrustStore(format!("parse {}: {e}", path.display())))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
                Err(e) => return Err(e.into()),
            };
            *guard = Some(map);
        }
        Ok(guard.as_mut().unwrap())
    }

    fn persist(path: &Path, map: &HashMap<String, String>) -> CryptoResult<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let data = serde_json::to_vec_pretty(map)
            .map_err(|e| CryptoError::TrustStore(format!("encode: {e}")))?;
        std::fs::write(path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_contact_pins() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::at(dir.path().join("known_peers.json"));

        store.admit("peer-b", "aa".repeat(32).as_str()).unwrap();
        assert_eq!(store.get("peer-b").unwrap().unwrap(), "aa".repeat(32));
    }

    #[test]
    fn test_matching_fingerprint_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::at(dir.path().join("known_peers.json"));
        let fp = "bb".repeat(32);

        store.admit("peer-b", &fp).unwrap();
        store.admit("peer-b", &fp).unwrap();
    }

    #[test]
    fn test_mismatch_rejected_and_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_peers.json");
        let store = TrustStore::at(&path);
        let first = "cc".repeat(32);

        store.admit("peer-b", &first).unwrap();
        let err = store.admit("peer-b", &"dd".repeat(32)).unwrap_err();
        assert!(matches!(err, CryptoError::TrustMismatch { .. }));

        // Both the cache and the file still hold the original pin.
        assert_eq!(store.get("peer-b").unwrap().unwrap(), first);
        let reloaded = TrustStore::at(&path);
        assert_eq!(reloaded.get("peer-b").unwrap().unwrap(), first);
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::at(dir.path().join("nope").join("known_peers.json"));
        assert!(store.get("anyone").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_store_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust").join("known_peers.json");
        let store = TrustStore::at(&path);
        store.admit("peer-b", &"ee".repeat(32)).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
