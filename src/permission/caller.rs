use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::CallerIdentity;

/// Opaque OS-level identity of a connection: the peer's uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerHandle {
    pub uid: u32,
}

/// Turns a caller handle into the calling app's package and certificate.
pub trait CallerIdentityResolver: Send + Sync {
    /// `Ok(None)` when no package is known for the handle.
    fn resolve(&self, handle: &CallerHandle) -> Result<Option<CallerIdentity>>;
}

/// One installed package as listed in `packages.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledPackage {
    pub uid: u32,
    pub name: String,
    /// Hex-encoded signing certificates, in order.
    pub certificates: Vec<String>,
}

impl InstalledPackage {
    /// All certificates concatenated, as compared against a registration.
    pub fn certificate_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for (i, cert) in self.certificates.iter().enumerate() {
            let decoded = hex::decode(cert.trim()).with_context(|| {
                format!("invalid certificate #{} for package '{}'", i, self.name)
            })?;
            bytes.extend_from_slice(&decoded);
        }
        Ok(bytes)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackagesFile {
    #[serde(default, rename = "package")]
    packages: Vec<InstalledPackage>,
}

/// Installed-package registry read from `packages.toml`:
///
/// ```toml
/// [[package]]
/// uid = 10123
/// name = "org.example.mail"
/// certificates = ["3082..."]
/// ```
///
/// Several packages may share one uid. The resolver then picks the first one
/// listed; telling them apart needs information the uid does not carry, so
/// shared-uid packages effectively share one trust identity.
pub struct PackageRegistry {
    path: PathBuf,
}

impl PackageRegistry {
    pub fn open_at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn list(&self) -> Result<Vec<InstalledPackage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content =
            std::fs::read_to_string(&self.path).context("failed to read packages.toml")?;
        let file: PackagesFile =
            toml::from_str(&content).context("failed to parse packages.toml")?;
        Ok(file.packages)
    }
}

impl CallerIdentityResolver for PackageRegistry {
    fn resolve(&self, handle: &CallerHandle) -> Result<Option<CallerIdentity>> {
        let packages = self.list()?;
        let mut candidates = packages.iter().filter(|p| p.uid == handle.uid);

        let Some(first) = candidates.next() else {
            return Ok(None);
        };
        let shared = candidates.count();
        if shared > 0 {
            tracing::warn!(
                uid = handle.uid,
                package = %first.name,
                "uid is shared by {} other package(s); using the first one",
                shared
            );
        }

        Ok(Some(CallerIdentity {
            package: first.name.clone(),
            certificate: first.certificate_bytes()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir, content: &str) -> PackageRegistry {
        let path = dir.path().join("packages.toml");
        std::fs::write(&path, content).unwrap();
        PackageRegistry::open_at(path)
    }

    #[test]
    fn resolves_uid_to_package() {
        let dir = TempDir::new().unwrap();
        let registry = registry(
            &dir,
            r#"
[[package]]
uid = 10001
name = "org.example.mail"
certificates = ["0102", "0304"]
"#,
        );

        let caller = registry
            .resolve(&CallerHandle { uid: 10001 })
            .unwrap()
            .unwrap();
        assert_eq!(caller.package, "org.example.mail");
        assert_eq!(caller.certificate, vec![1, 2, 3, 4]);

        assert!(registry
            .resolve(&CallerHandle { uid: 10002 })
            .unwrap()
            .is_none());
    }

    #[test]
    fn shared_uid_picks_first_listed() {
        let dir = TempDir::new().unwrap();
        let registry = registry(
            &dir,
            r#"
[[package]]
uid = 10001
name = "org.example.first"
certificates = ["aa"]

[[package]]
uid = 10001
name = "org.example.second"
certificates = ["bb"]
"#,
        );

        let caller = registry
            .resolve(&CallerHandle { uid: 10001 })
            .unwrap()
            .unwrap();
        assert_eq!(caller.package, "org.example.first");
    }

    #[test]
    fn missing_file_resolves_nothing() {
        let dir = TempDir::new().unwrap();
        let registry = PackageRegistry::open_at(dir.path().join("packages.toml"));
        assert!(registry
            .resolve(&CallerHandle { uid: 1 })
            .unwrap()
            .is_none());
    }
}
