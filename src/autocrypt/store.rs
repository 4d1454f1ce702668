use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::AutocryptPeer;
use crate::keys::store::{validate_package_name, write_atomic};

/// Per-app Autocrypt peer records. Only the state machine writes here.
pub trait AutocryptStore: Send + Sync {
    fn peer(&self, package: &str, peer_id: &str) -> Result<Option<AutocryptPeer>>;

    fn save_peer(&self, package: &str, peer_id: &str, peer: &AutocryptPeer) -> Result<()>;

    /// Returns whether a record existed.
    fn delete_peer(&self, package: &str, peer_id: &str) -> Result<bool>;

    /// Drop every peer recorded for a package.
    fn delete_package(&self, package: &str) -> Result<()>;
}

/// One TOML file per package under `autocrypt/`.
pub struct PeerStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl PeerStore {
    pub fn open_at(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn package_path(&self, package: &str) -> Result<PathBuf> {
        validate_package_name(package)?;
        Ok(self.dir.join(format!("{}.toml", package)))
    }

    fn load(&self, package: &str) -> Result<BTreeMap<String, AutocryptPeer>> {
        let path = self.package_path(package)?;
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let peers = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(peers)
    }

    fn save(&self, package: &str, peers: &BTreeMap<String, AutocryptPeer>) -> Result<()> {
        let path = self.package_path(package)?;
        let content = toml::to_string_pretty(peers).context("failed to serialize peers")?;
        write_atomic(&path, content.as_bytes(), 0o600)
    }
}

impl AutocryptStore for PeerStore {
    fn peer(&self, package: &str, peer_id: &str) -> Result<Option<AutocryptPeer>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.load(package)?.remove(peer_id))
    }

    fn save_peer(&self, package: &str, peer_id: &str, peer: &AutocryptPeer) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut peers = self.load(package)?;
        peers.insert(peer_id.to_string(), peer.clone());
        self.save(package, &peers)
    }

    fn delete_peer(&self, package: &str, peer_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut peers = self.load(package)?;
        let existed = peers.remove(peer_id).is_some();
        if existed {
            self.save(package, &peers)?;
        }
        Ok(existed)
    }

    fn delete_package(&self, package: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.package_path(package)?;
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyId;
    use tempfile::TempDir;

    #[test]
    fn peers_are_scoped_per_package() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::open_at(dir.path().join("autocrypt"));

        let peer = AutocryptPeer {
            last_seen: Some(100),
            trusted_key_id: Some(KeyId::new(5)),
            ..Default::default()
        };
        store.save_peer("org.example.mail", "bob@x.org", &peer).unwrap();

        assert_eq!(
            store.peer("org.example.mail", "bob@x.org").unwrap(),
            Some(peer)
        );
        assert!(store.peer("org.example.chat", "bob@x.org").unwrap().is_none());

        assert!(store.delete_peer("org.example.mail", "bob@x.org").unwrap());
        assert!(!store.delete_peer("org.example.mail", "bob@x.org").unwrap());
    }

    #[test]
    fn rejects_path_like_package_names() {
        let dir = TempDir::new().unwrap();
        let store = PeerStore::open_at(dir.path().join("autocrypt"));
        assert!(store.peer("../apps", "bob@x.org").is_err());
    }
}
