//! Recipient resolution: symbolic identifiers and explicit key ids to a set
//! of usable keys, or a description of what is missing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::autocrypt::{normalize_peer_id, Autocrypt, Recommendation};
use crate::clock::Clock;
use crate::error::ApiError;
use crate::keys::store::KeyRepository;
use crate::keys::KeyId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResolutionRequest {
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub key_ids: Vec<KeyId>,
    #[serde(default)]
    pub opportunistic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OpportunisticMissing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolutionOutcome {
    /// Never empty.
    Resolved {
        key_ids: Vec<KeyId>,
        recommendation: Recommendation,
    },
    AmbiguousOrMissing {
        found: Vec<KeyId>,
        missing: Vec<String>,
        duplicate: Vec<String>,
    },
    Rejected(RejectReason),
}

pub struct KeyResolver {
    autocrypt: Arc<Autocrypt>,
    keys: Arc<dyn KeyRepository>,
    clock: Arc<dyn Clock>,
}

fn push_unique(ids: &mut Vec<KeyId>, id: KeyId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

impl KeyResolver {
    pub fn new(
        autocrypt: Arc<Autocrypt>,
        keys: Arc<dyn KeyRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            autocrypt,
            keys,
            clock,
        }
    }

    /// Resolve recipients on behalf of `package`.
    ///
    /// A peer the app has Autocrypt state for resolves to that state's key.
    /// Anything else is looked up in the key store by address, skipping
    /// revoked and expired keys.
    pub fn resolve(
        &self,
        package: &str,
        request: &KeyResolutionRequest,
    ) -> Result<KeyResolutionOutcome, ApiError> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        let mut duplicate = Vec::new();
        let mut recommendation = Recommendation::Mutual;

        for key_id in &request.key_ids {
            push_unique(&mut found, *key_id);
            recommendation = recommendation.min(Recommendation::Available);
        }

        let now = self.clock.unix_now();
        let mut seen = Vec::new();
        for identifier in &request.identifiers {
            let address = normalize_peer_id(identifier);
            if seen.contains(&address) {
                continue;
            }
            seen.push(address.clone());

            let status = self.autocrypt.classify(package, &address)?;
            if let (true, Some(key_id)) = (
                status.recommendation != Recommendation::Disabled,
                status.key_id,
            ) {
                push_unique(&mut found, key_id);
                recommendation = recommendation.min(status.recommendation);
                continue;
            }

            let matches: Vec<KeyId> = self
                .keys
                .find_by_address(&address)?
                .into_iter()
                .filter(|key| key.is_usable_at(now))
                .map(|key| key.key_id())
                .collect();

            match matches.as_slice() {
                [] => missing.push(identifier.clone()),
                [key_id] => {
                    push_unique(&mut found, *key_id);
                    recommendation = recommendation.min(Recommendation::Available);
                }
                _ => {
                    for key_id in matches {
                        push_unique(&mut found, key_id);
                    }
                    duplicate.push(identifier.clone());
                }
            }
        }

        let nothing_supplied = request.identifiers.is_empty() && request.key_ids.is_empty();

        if request.opportunistic && (!missing.is_empty() || nothing_supplied) {
            tracing::debug!(package = %package, missing = missing.len(), "opportunistic resolution rejected");
            return Ok(KeyResolutionOutcome::Rejected(
                RejectReason::OpportunisticMissing,
            ));
        }

        if !missing.is_empty() || !duplicate.is_empty() || nothing_supplied {
            return Ok(KeyResolutionOutcome::AmbiguousOrMissing {
                found,
                missing,
                duplicate,
            });
        }

        if found.is_empty() {
            tracing::error!(package = %package, "resolution produced no keys and no gaps");
            return Err(ApiError::InvariantViolation("empty key resolution"));
        }

        Ok(KeyResolutionOutcome::Resolved {
            key_ids: found,
            recommendation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autocrypt::{DirectUpdate, PeerStore, PreferEncrypt};
    use crate::clock::ManualClock;
    use crate::keys::identity::SecretKeyBundle;
    use crate::keys::store::KeyStore;
    use std::time::Duration;
    use tempfile::TempDir;

    const PKG: &str = "org.example.mail";

    struct Fixture {
        _dir: TempDir,
        keys: Arc<KeyStore>,
        autocrypt: Arc<Autocrypt>,
        resolver: KeyResolver,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let keys = Arc::new(KeyStore::open_at(dir.path().to_path_buf()));
        let peers = Arc::new(PeerStore::open_at(dir.path().join("autocrypt")));
        let clock = Arc::new(ManualClock::at_unix(10_000));
        let autocrypt = Arc::new(Autocrypt::new(
            peers,
            keys.clone(),
            keys.clone(),
            clock.clone(),
            Duration::from_secs(35 * 24 * 60 * 60),
        ));
        let resolver = KeyResolver::new(autocrypt.clone(), keys.clone(), clock);
        Fixture {
            _dir: dir,
            keys,
            autocrypt,
            resolver,
        }
    }

    fn stored_key(f: &Fixture, uid: &str, expires: Option<u64>) -> KeyId {
        let key = SecretKeyBundle::generate(vec![uid.to_string()], 1_000, expires);
        f.keys.save_public(&key.public()).unwrap()
    }

    fn request(identifiers: &[&str], opportunistic: bool) -> KeyResolutionRequest {
        KeyResolutionRequest {
            identifiers: identifiers.iter().map(|s| s.to_string()).collect(),
            key_ids: Vec::new(),
            opportunistic,
        }
    }

    #[test]
    fn single_match_resolves() {
        let f = fixture();
        let id = stored_key(&f, "Alice <alice@x.org>", None);

        let outcome = f
            .resolver
            .resolve(PKG, &request(&["ALICE@x.org"], false))
            .unwrap();
        assert_eq!(
            outcome,
            KeyResolutionOutcome::Resolved {
                key_ids: vec![id],
                recommendation: Recommendation::Available
            }
        );
    }

    #[test]
    fn duplicate_and_missing_are_reported() {
        let f = fixture();
        let a1 = stored_key(&f, "a@x.org", None);
        let a2 = stored_key(&f, "A <a@x.org>", None);

        let outcome = f.resolver.resolve(PKG, &request(&["a@x.org"], false)).unwrap();
        let KeyResolutionOutcome::AmbiguousOrMissing {
            mut found,
            missing,
            duplicate,
        } = outcome
        else {
            panic!("expected ambiguity, got {:?}", outcome);
        };
        found.sort();
        let mut expected = vec![a1, a2];
        expected.sort();
        assert_eq!(found, expected);
        assert!(missing.is_empty());
        assert_eq!(duplicate, vec!["a@x.org".to_string()]);

        let outcome = f.resolver.resolve(PKG, &request(&["b@x.org"], false)).unwrap();
        assert_eq!(
            outcome,
            KeyResolutionOutcome::AmbiguousOrMissing {
                found: vec![],
                missing: vec!["b@x.org".to_string()],
                duplicate: vec![],
            }
        );
    }

    #[test]
    fn repeated_identifiers_are_reported_once() {
        let f = fixture();
        stored_key(&f, "a@x.org", None);
        stored_key(&f, "A <a@x.org>", None);

        let outcome = f
            .resolver
            .resolve(PKG, &request(&["a@x.org", "A@X.org", "b@x.org", "b@x.org"], false))
            .unwrap();
        let KeyResolutionOutcome::AmbiguousOrMissing {
            found,
            missing,
            duplicate,
        } = outcome
        else {
            panic!("expected ambiguity, got {:?}", outcome);
        };
        assert_eq!(found.len(), 2);
        assert_eq!(missing, vec!["b@x.org".to_string()]);
        assert_eq!(duplicate, vec!["a@x.org".to_string()]);
    }

    #[test]
    fn revoked_and_expired_keys_are_skipped() {
        let f = fixture();
        stored_key(&f, "old@x.org", Some(5_000));
        let key = SecretKeyBundle::generate(vec!["gone@x.org".to_string()], 1_000, None);
        let mut revoked = key.public();
        revoked.revoked = true;
        f.keys.save_public(&revoked).unwrap();

        let outcome = f
            .resolver
            .resolve(PKG, &request(&["old@x.org", "gone@x.org"], false))
            .unwrap();
        assert!(matches!(
            outcome,
            KeyResolutionOutcome::AmbiguousOrMissing { ref missing, .. } if missing.len() == 2
        ));
    }

    #[test]
    fn opportunistic_fails_closed() {
        let f = fixture();
        stored_key(&f, "a@x.org", None);

        assert_eq!(
            f.resolver
                .resolve(PKG, &request(&["a@x.org", "missing@x.org"], true))
                .unwrap(),
            KeyResolutionOutcome::Rejected(RejectReason::OpportunisticMissing)
        );
        assert_eq!(
            f.resolver.resolve(PKG, &request(&[], true)).unwrap(),
            KeyResolutionOutcome::Rejected(RejectReason::OpportunisticMissing)
        );
    }

    #[test]
    fn nothing_supplied_needs_a_choice() {
        let f = fixture();
        assert_eq!(
            f.resolver.resolve(PKG, &request(&[], false)).unwrap(),
            KeyResolutionOutcome::AmbiguousOrMissing {
                found: vec![],
                missing: vec![],
                duplicate: vec![],
            }
        );
    }

    #[test]
    fn explicit_key_ids_are_used_as_is() {
        let f = fixture();
        let id = stored_key(&f, "a@x.org", None);
        let unknown = KeyId::new(0x1234);

        let outcome = f
            .resolver
            .resolve(
                PKG,
                &KeyResolutionRequest {
                    identifiers: vec!["a@x.org".to_string()],
                    key_ids: vec![unknown, id],
                    opportunistic: false,
                },
            )
            .unwrap();
        assert_eq!(
            outcome,
            KeyResolutionOutcome::Resolved {
                key_ids: vec![unknown, id],
                recommendation: Recommendation::Available
            }
        );
    }

    #[test]
    fn autocrypt_key_takes_precedence() {
        let f = fixture();
        stored_key(&f, "bob@x.org", None);
        stored_key(&f, "bob@x.org", None);
        let direct = SecretKeyBundle::generate(vec!["bob@x.org".to_string()], 1_000, None);
        f.autocrypt
            .update_direct(
                PKG,
                "bob@x.org",
                &DirectUpdate {
                    effective_date: 9_000,
                    key_data: Some(direct.public().to_text().into_bytes()),
                    prefer_encrypt: PreferEncrypt::Mutual,
                },
            )
            .unwrap();

        let outcome = f.resolver.resolve(PKG, &request(&["bob@x.org"], false)).unwrap();
        assert_eq!(
            outcome,
            KeyResolutionOutcome::Resolved {
                key_ids: vec![direct.key_id()],
                recommendation: Recommendation::Mutual
            }
        );

        // Another app has no Autocrypt state and sees the keyring ambiguity.
        let other = f
            .resolver
            .resolve("org.example.chat", &request(&["bob@x.org"], false))
            .unwrap();
        assert!(matches!(
            other,
            KeyResolutionOutcome::AmbiguousOrMissing { ref duplicate, .. } if duplicate.len() == 1
        ));
    }
}
