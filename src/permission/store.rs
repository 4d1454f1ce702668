use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::RegisteredApp;
use crate::keys::store::{validate_package_name, write_atomic};
use crate::keys::KeyId;

/// Durable record of registered apps and the keys each may use.
/// Pure data access; trust decisions live in the guard.
pub trait PermissionStore: Send + Sync {
    fn registered_app(&self, package: &str) -> Result<Option<RegisteredApp>>;

    /// Insert a registration. Errors if the package is already registered.
    fn insert_app(&self, app: &RegisteredApp) -> Result<()>;

    /// Remove a registration and every key grant for it.
    fn delete_app(&self, package: &str) -> Result<bool>;

    fn list_apps(&self) -> Result<Vec<RegisteredApp>>;

    fn allowed_keys(&self, package: &str) -> Result<BTreeSet<KeyId>>;

    /// Returns false if the grant already existed.
    fn add_allowed_key(&self, package: &str, key_id: KeyId) -> Result<bool>;

    /// Returns whether the grant existed.
    fn remove_allowed_key(&self, package: &str, key_id: KeyId) -> Result<bool>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AppEntry {
    /// Hex-encoded certificate bytes.
    certificate: String,
    #[serde(default)]
    allowed_keys: BTreeSet<KeyId>,
}

/// `apps.toml`-backed permission store.
pub struct AppStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AppStore {
    pub fn open_at(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, AppEntry>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path).context("failed to read apps.toml")?;
        let apps: BTreeMap<String, AppEntry> =
            toml::from_str(&content).context("failed to parse apps.toml")?;
        Ok(apps)
    }

    fn save(&self, apps: &BTreeMap<String, AppEntry>) -> Result<()> {
        let content = toml::to_string_pretty(apps).context("failed to serialize apps")?;
        write_atomic(&self.path, content.as_bytes(), 0o600).context("failed to write apps.toml")
    }

    /// Run a read-modify-write under the store lock.
    fn modify<R>(&self, f: impl FnOnce(&mut BTreeMap<String, AppEntry>) -> Result<(R, bool)>) -> Result<R> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut apps = self.load()?;
        let (result, changed) = f(&mut apps)?;
        if changed {
            self.save(&apps)?;
        }
        Ok(result)
    }
}

fn to_app(package: &str, entry: &AppEntry) -> Result<RegisteredApp> {
    let certificate = hex::decode(&entry.certificate)
        .with_context(|| format!("invalid certificate for '{}' in apps.toml", package))?;
    Ok(RegisteredApp {
        package: package.to_string(),
        certificate,
    })
}

impl PermissionStore for AppStore {
    fn registered_app(&self, package: &str) -> Result<Option<RegisteredApp>> {
        let apps = self.load()?;
        apps.get(package).map(|e| to_app(package, e)).transpose()
    }

    fn insert_app(&self, app: &RegisteredApp) -> Result<()> {
        validate_package_name(&app.package)?;
        self.modify(|apps| {
            if apps.contains_key(&app.package) {
                bail!("package '{}' is already registered", app.package);
            }
            apps.insert(
                app.package.clone(),
                AppEntry {
                    certificate: hex::encode(&app.certificate),
                    allowed_keys: BTreeSet::new(),
                },
            );
            Ok(((), true))
        })
    }

    fn delete_app(&self, package: &str) -> Result<bool> {
        self.modify(|apps| {
            let existed = apps.remove(package).is_some();
            Ok((existed, existed))
        })
    }

    fn list_apps(&self) -> Result<Vec<RegisteredApp>> {
        let apps = self.load()?;
        apps.iter().map(|(pkg, e)| to_app(pkg, e)).collect()
    }

    fn allowed_keys(&self, package: &str) -> Result<BTreeSet<KeyId>> {
        let apps = self.load()?;
        Ok(apps
            .get(package)
            .map(|e| e.allowed_keys.clone())
            .unwrap_or_default())
    }

    fn add_allowed_key(&self, package: &str, key_id: KeyId) -> Result<bool> {
        self.modify(|apps| {
            let entry = apps
                .get_mut(package)
                .ok_or_else(|| anyhow::anyhow!("package '{}' is not registered", package))?;
            let added = entry.allowed_keys.insert(key_id);
            Ok((added, added))
        })
    }

    fn remove_allowed_key(&self, package: &str, key_id: KeyId) -> Result<bool> {
        self.modify(|apps| {
            let removed = apps
                .get_mut(package)
                .map(|e| e.allowed_keys.remove(&key_id))
                .unwrap_or(false);
            Ok((removed, removed))
        })
    }
}
