pub mod caller;
pub mod store;

use std::sync::Arc;

use crate::autocrypt::store::AutocryptStore;
use crate::error::ApiError;
use crate::keys::KeyId;

pub use caller::{CallerHandle, CallerIdentityResolver, PackageRegistry};
pub use store::{AppStore, PermissionStore};

/// The calling app as seen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub package: String,
    pub certificate: Vec<u8>,
}

/// A package the user has allowed to use the gateway, pinned to the
/// certificate it presented at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredApp {
    pub package: String,
    pub certificate: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionCheck {
    Allowed,
    NeedsRegistration(CallerIdentity),
    /// Registered under this package, but with different certificate bytes.
    CertificateMismatch,
}

/// Decides whether a caller may use the gateway, and which keys it may use.
pub struct PermissionGuard {
    apps: Arc<dyn PermissionStore>,
    peers: Arc<dyn AutocryptStore>,
}

impl PermissionGuard {
    pub fn new(apps: Arc<dyn PermissionStore>, peers: Arc<dyn AutocryptStore>) -> Self {
        Self { apps, peers }
    }

    pub fn check(&self, caller: &CallerIdentity) -> Result<PermissionCheck, ApiError> {
        let Some(app) = self.apps.registered_app(&caller.package)? else {
            return Ok(PermissionCheck::NeedsRegistration(caller.clone()));
        };

        if app.certificate.is_empty() {
            tracing::error!(package = %caller.package, "registered app has an empty certificate");
            return Err(ApiError::InvariantViolation(
                "registered certificate is empty",
            ));
        }

        if app.certificate == caller.certificate {
            Ok(PermissionCheck::Allowed)
        } else {
            tracing::warn!(
                package = %caller.package,
                "caller certificate does not match registration"
            );
            Ok(PermissionCheck::CertificateMismatch)
        }
    }

    /// Whether the caller was explicitly granted use of `key_id`.
    pub fn check_key_access(
        &self,
        caller: &CallerIdentity,
        key_id: KeyId,
    ) -> Result<bool, ApiError> {
        Ok(self.apps.allowed_keys(&caller.package)?.contains(&key_id))
    }

    /// Register the caller. Call only after the user consented.
    pub fn register(&self, caller: &CallerIdentity) -> Result<(), ApiError> {
        if caller.certificate.is_empty() {
            return Err(ApiError::InvariantViolation(
                "refusing to register an empty certificate",
            ));
        }
        match self.check(caller)? {
            PermissionCheck::Allowed => Ok(()),
            PermissionCheck::CertificateMismatch => Err(ApiError::CertificateMismatch),
            PermissionCheck::NeedsRegistration(_) => {
                self.apps.insert_app(&RegisteredApp {
                    package: caller.package.clone(),
                    certificate: caller.certificate.clone(),
                })?;
                tracing::info!(package = %caller.package, "registered app");
                Ok(())
            }
        }
    }

    /// Allow the caller to use `key_id`. Call only after the user consented.
    pub fn grant_key_access(&self, caller: &CallerIdentity, key_id: KeyId) -> Result<(), ApiError> {
        match self.check(caller)? {
            PermissionCheck::Allowed => {
                if self.apps.add_allowed_key(&caller.package, key_id)? {
                    tracing::info!(package = %caller.package, key_id = %key_id, "granted key access");
                }
                Ok(())
            }
            PermissionCheck::CertificateMismatch => Err(ApiError::CertificateMismatch),
            PermissionCheck::NeedsRegistration(_) => Err(ApiError::NotRegistered),
        }
    }

    /// Forget everything about an uninstalled package.
    pub fn purge(&self, package: &str) -> Result<(), ApiError> {
        let existed = self.apps.delete_app(package)?;
        self.peers.delete_package(package)?;
        tracing::info!(package = %package, registered = existed, "purged package");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autocrypt::store::PeerStore;
    use crate::autocrypt::AutocryptPeer;
    use tempfile::TempDir;

    fn guard(dir: &TempDir) -> (PermissionGuard, Arc<AppStore>, Arc<PeerStore>) {
        let apps = Arc::new(AppStore::open_at(dir.path().join("apps.toml")));
        let peers = Arc::new(PeerStore::open_at(dir.path().join("autocrypt")));
        (
            PermissionGuard::new(apps.clone(), peers.clone()),
            apps,
            peers,
        )
    }

    fn caller(package: &str, cert: &[u8]) -> CallerIdentity {
        CallerIdentity {
            package: package.to_string(),
            certificate: cert.to_vec(),
        }
    }

    #[test]
    fn unregistered_needs_registration() {
        let dir = TempDir::new().unwrap();
        let (guard, _, _) = guard(&dir);
        let mail = caller("org.example.mail", b"cert");

        assert_eq!(
            guard.check(&mail).unwrap(),
            PermissionCheck::NeedsRegistration(mail.clone())
        );
    }

    #[test]
    fn certificate_is_pinned_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        let (guard, _, _) = guard(&dir);
        let cert = vec![0x30, 0x82, 0x01, 0x0a, 0x02, 0x82];
        guard.register(&caller("org.example.mail", &cert)).unwrap();

        assert_eq!(
            guard.check(&caller("org.example.mail", &cert)).unwrap(),
            PermissionCheck::Allowed
        );

        for i in 0..cert.len() {
            let mut tampered = cert.clone();
            tampered[i] ^= 0x01;
            assert_eq!(
                guard.check(&caller("org.example.mail", &tampered)).unwrap(),
                PermissionCheck::CertificateMismatch,
                "flipped byte {} must not be allowed",
                i
            );
        }

        let mut longer = cert.clone();
        longer.push(0);
        assert_eq!(
            guard.check(&caller("org.example.mail", &longer)).unwrap(),
            PermissionCheck::CertificateMismatch
        );
    }

    #[test]
    fn register_never_overwrites_a_mismatch() {
        let dir = TempDir::new().unwrap();
        let (guard, apps, _) = guard(&dir);
        guard.register(&caller("org.example.mail", b"good")).unwrap();
        guard.register(&caller("org.example.mail", b"good")).unwrap();

        let err = guard
            .register(&caller("org.example.mail", b"evil"))
            .unwrap_err();
        assert!(matches!(err, ApiError::CertificateMismatch));
        assert_eq!(
            apps.registered_app("org.example.mail")
                .unwrap()
                .unwrap()
                .certificate,
            b"good"
        );
    }

    #[test]
    fn empty_stored_certificate_is_a_defect() {
        let dir = TempDir::new().unwrap();
        let (guard, apps, _) = guard(&dir);
        apps.insert_app(&RegisteredApp {
            package: "org.example.mail".to_string(),
            certificate: Vec::new(),
        })
        .unwrap();

        let err = guard.check(&caller("org.example.mail", b"")).unwrap_err();
        assert!(matches!(err, ApiError::InvariantViolation(_)));
    }

    #[test]
    fn key_access_requires_grant() {
        let dir = TempDir::new().unwrap();
        let (guard, _, _) = guard(&dir);
        let mail = caller("org.example.mail", b"cert");
        let key = KeyId::new(7);

        assert!(matches!(
            guard.grant_key_access(&mail, key),
            Err(ApiError::NotRegistered)
        ));

        guard.register(&mail).unwrap();
        assert!(!guard.check_key_access(&mail, key).unwrap());
        guard.grant_key_access(&mail, key).unwrap();
        assert!(guard.check_key_access(&mail, key).unwrap());
        assert!(!guard.check_key_access(&mail, KeyId::new(8)).unwrap());
    }

    #[test]
    fn purge_forgets_registration_grants_and_peers() {
        let dir = TempDir::new().unwrap();
        let (guard, _, peers) = guard(&dir);
        let mail = caller("org.example.mail", b"cert");
        let key = KeyId::new(7);

        guard.register(&mail).unwrap();
        guard.grant_key_access(&mail, key).unwrap();
        peers
            .save_peer("org.example.mail", "bob@x.org", &AutocryptPeer::default())
            .unwrap();

        guard.purge("org.example.mail").unwrap();

        assert_eq!(
            guard.check(&caller("org.example.mail", b"any")).unwrap(),
            PermissionCheck::NeedsRegistration(caller("org.example.mail", b"any"))
        );
        assert!(!guard.check_key_access(&mail, key).unwrap());
        assert!(peers.peer("org.example.mail", "bob@x.org").unwrap().is_none());
    }
}
