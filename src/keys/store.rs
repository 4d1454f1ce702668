use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;

use super::bundle::PublicKeyBundle;
use super::KeyId;

/// Read access to public key material, plus import of public-only bundles.
pub trait KeyRepository: Send + Sync {
    /// Store a public bundle, merging into an existing copy of the same key.
    fn save_public(&self, bundle: &PublicKeyBundle) -> Result<KeyId>;

    /// Store a bundle only if its key is not known yet. A known key is left
    /// exactly as stored. Returns the key id and whether it was stored.
    fn insert_public(&self, bundle: &PublicKeyBundle) -> Result<(KeyId, bool)>;

    fn public_key(&self, key_id: KeyId) -> Result<Option<PublicKeyBundle>>;

    fn list_public(&self) -> Result<Vec<PublicKeyBundle>>;

    /// All keys claiming `address`, regardless of revocation or expiry.
    fn find_by_address(&self, address: &str) -> Result<Vec<PublicKeyBundle>> {
        Ok(self
            .list_public()?
            .into_iter()
            .filter(|key| key.claims_address(address))
            .collect())
    }
}

/// Passphrase-sealed secret keys owned by the gateway.
pub trait SecretKeyRepository: Send + Sync {
    fn save_secret(&self, key_id: KeyId, sealed: &[u8]) -> Result<()>;

    fn sealed_secret(&self, key_id: KeyId) -> Result<Option<Vec<u8>>>;

    fn list_secret(&self) -> Result<Vec<KeyId>>;
}

/// Validate that a package name contains only safe characters.
pub fn validate_package_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("package name cannot be empty");
    }
    if name.starts_with('.')
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        bail!(
            "package name '{}' contains invalid characters (use A-Z, a-z, 0-9, _, -, .)",
            name
        );
    }
    Ok(())
}

/// Replace `path` with `content` so that readers see either the old or the
/// new file, never a partial one. The file gets `mode` on unix.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    file.write_all(content)
        .and_then(|_| file.as_file().sync_all())
        .with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    file.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Manages the gateway's config directory and file layout.
pub struct KeyStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl KeyStore {
    /// Open the key store at the default platform config directory.
    pub fn open() -> Result<Self> {
        let dirs = ProjectDirs::from("org", "pgpgate", "pgpgate")
            .context("could not determine config directory")?;
        Ok(Self::open_at(dirs.config_dir().to_path_buf()))
    }

    /// Open the key store at a specific directory.
    pub fn open_at(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Ensure the key store directory structure exists.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.public_dir(), self.secret_dir(), self.autocrypt_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn public_dir(&self) -> PathBuf {
        self.base_dir.join("keys").join("public")
    }

    pub fn secret_dir(&self) -> PathBuf {
        self.base_dir.join("keys").join("secret")
    }

    pub fn public_key_path(&self, key_id: KeyId) -> PathBuf {
        self.public_dir().join(format!("{}.pub", key_id))
    }

    pub fn secret_key_path(&self, key_id: KeyId) -> PathBuf {
        self.secret_dir().join(format!("{}.sec", key_id))
    }

    // --- Config file paths ---

    pub fn apps_path(&self) -> PathBuf {
        self.base_dir.join("apps.toml")
    }

    pub fn packages_path(&self) -> PathBuf {
        self.base_dir.join("packages.toml")
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join("gateway.toml")
    }

    pub fn autocrypt_dir(&self) -> PathBuf {
        self.base_dir.join("autocrypt")
    }

    /// Write a file with restrictive permissions (0600) for secret keys.
    pub fn write_private(&self, path: &Path, content: &[u8]) -> Result<()> {
        write_atomic(path, content, 0o600)
    }

    fn list_ids(dir: &Path, extension: &str) -> Result<Vec<KeyId>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some(extension) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read_public(&self, key_id: KeyId) -> Result<Option<PublicKeyBundle>> {
        let path = self.public_key_path(key_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let bundle = PublicKeyBundle::parse_public(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(bundle))
    }
}

impl KeyRepository for KeyStore {
    fn save_public(&self, bundle: &PublicKeyBundle) -> Result<KeyId> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_dirs()?;

        let key_id = bundle.key_id();
        let merged = match self.read_public(key_id)? {
            Some(mut existing) => {
                existing.merge(bundle);
                existing
            }
            None => bundle.clone(),
        };
        write_atomic(&self.public_key_path(key_id), merged.to_text().as_bytes(), 0o644)?;

        tracing::debug!(key_id = %key_id, "stored public key");
        Ok(key_id)
    }

    fn insert_public(&self, bundle: &PublicKeyBundle) -> Result<(KeyId, bool)> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let key_id = bundle.key_id();
        let path = self.public_key_path(key_id);
        if path.exists() {
            return Ok((key_id, false));
        }
        self.ensure_dirs()?;
        write_atomic(&path, bundle.to_text().as_bytes(), 0o644)?;
        tracing::debug!(key_id = %key_id, "stored new public key");
        Ok((key_id, true))
    }

    fn public_key(&self, key_id: KeyId) -> Result<Option<PublicKeyBundle>> {
        self.read_public(key_id)
    }

    fn list_public(&self) -> Result<Vec<PublicKeyBundle>> {
        let mut keys = Vec::new();
        for key_id in Self::list_ids(&self.public_dir(), "pub")? {
            match self.read_public(key_id) {
                Ok(Some(key)) => keys.push(key),
                Ok(None) => {}
                Err(e) => tracing::warn!(key_id = %key_id, "skipping unreadable key: {:#}", e),
            }
        }
        Ok(keys)
    }
}

impl SecretKeyRepository for KeyStore {
    fn save_secret(&self, key_id: KeyId, sealed: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ensure_dirs()?;
        self.write_private(&self.secret_key_path(key_id), sealed)
    }

    fn sealed_secret(&self, key_id: KeyId) -> Result<Option<Vec<u8>>> {
        let path = self.secret_key_path(key_id);
        if !path.exists() {
            return Ok(None);
        }
        let sealed = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(sealed))
    }

    fn list_secret(&self) -> Result<Vec<KeyId>> {
        Self::list_ids(&self.secret_dir(), "sec")
    }
}
