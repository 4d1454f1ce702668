use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use super::{
    normalize_peer_id, AutocryptPeer, AutocryptStatus, AutocryptStore, DirectUpdate,
    GossipUpdate, PeerStatus, PreferEncrypt, Recommendation, UpdateOutcome,
};
use crate::clock::Clock;
use crate::keys::bundle::PublicKeyBundle;
use crate::keys::store::{KeyRepository, SecretKeyRepository};
use crate::keys::KeyId;

/// Serializes work on one (package, peer) record without blocking others.
#[derive(Default)]
struct PeerLocks {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl PeerLocks {
    fn with_lock<R>(&self, package: &str, peer_id: &str, f: impl FnOnce() -> R) -> R {
        let key = (package.to_string(), peer_id.to_string());
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };

        // Only the map and this call hold it: nobody else is waiting.
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        result
    }
}

/// The Autocrypt state machine.
///
/// Updates are monotonic per channel: an update whose effective date is not
/// strictly after the stored one for its channel changes nothing on that
/// channel. Key data is only ever accepted as public-only material, and it
/// never changes a key the store already knows: header data carries no proof
/// that the key holder wrote it.
pub struct Autocrypt {
    peers: Arc<dyn AutocryptStore>,
    keys: Arc<dyn KeyRepository>,
    secrets: Arc<dyn SecretKeyRepository>,
    clock: Arc<dyn Clock>,
    stale_after_secs: u64,
    locks: PeerLocks,
}

impl Autocrypt {
    pub fn new(
        peers: Arc<dyn AutocryptStore>,
        keys: Arc<dyn KeyRepository>,
        secrets: Arc<dyn SecretKeyRepository>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
    ) -> Self {
        Self {
            peers,
            keys,
            secrets,
            clock,
            stale_after_secs: stale_after.as_secs(),
            locks: PeerLocks::default(),
        }
    }

    /// Apply a header the peer sent itself.
    pub fn update_direct(
        &self,
        package: &str,
        peer_id: &str,
        update: &DirectUpdate,
    ) -> Result<UpdateOutcome> {
        let peer_id = normalize_peer_id(peer_id);
        self.locks.with_lock(package, &peer_id, || {
            let mut peer = self.peers.peer(package, &peer_id)?.unwrap_or_default();

            if peer
                .last_seen
                .is_some_and(|last_seen| update.effective_date <= last_seen)
            {
                tracing::debug!(package = %package, peer = %peer_id, "ignoring stale autocrypt update");
                return Ok(UpdateOutcome::Stale);
            }
            peer.last_seen = Some(update.effective_date);

            let Some(key_data) = &update.key_data else {
                self.peers.save_peer(package, &peer_id, &peer)?;
                return Ok(UpdateOutcome::Seen);
            };

            let Some(key_id) = self.import_key(package, &peer_id, key_data)? else {
                self.peers.save_peer(package, &peer_id, &peer)?;
                return Ok(UpdateOutcome::KeyRejected);
            };

            peer.trusted_key_id = Some(key_id);
            peer.last_seen_key = Some(update.effective_date);
            peer.is_mutual = update.prefer_encrypt == PreferEncrypt::Mutual;
            self.peers.save_peer(package, &peer_id, &peer)?;

            tracing::debug!(package = %package, peer = %peer_id, key_id = %key_id, "autocrypt key updated");
            Ok(UpdateOutcome::KeyUpdated(key_id))
        })
    }

    /// Apply a gossip header. Only touches the gossip sub-state.
    pub fn update_gossip(
        &self,
        package: &str,
        peer_id: &str,
        update: &GossipUpdate,
    ) -> Result<UpdateOutcome> {
        let peer_id = normalize_peer_id(peer_id);
        self.locks.with_lock(package, &peer_id, || {
            let mut peer = self.peers.peer(package, &peer_id)?.unwrap_or_default();

            if peer
                .last_seen_gossip
                .is_some_and(|last| update.effective_date <= last)
            {
                tracing::debug!(package = %package, peer = %peer_id, "ignoring stale autocrypt gossip");
                return Ok(UpdateOutcome::Stale);
            }

            let Some(key_data) = &update.key_data else {
                return Ok(UpdateOutcome::Seen);
            };

            let Some(key_id) = self.import_key(package, &peer_id, key_data)? else {
                return Ok(UpdateOutcome::KeyRejected);
            };

            peer.gossip_key_id = Some(key_id);
            peer.last_seen_gossip = Some(update.effective_date);
            self.peers.save_peer(package, &peer_id, &peer)?;

            tracing::debug!(package = %package, peer = %peer_id, key_id = %key_id, "autocrypt gossip key updated");
            Ok(UpdateOutcome::KeyUpdated(key_id))
        })
    }

    /// Parse and persist public key data. `None` means it was dropped.
    fn import_key(&self, package: &str, peer_id: &str, key_data: &[u8]) -> Result<Option<KeyId>> {
        let bundle = match PublicKeyBundle::parse_public(key_data) {
            Ok(bundle) => bundle,
            Err(e) => {
                tracing::warn!(package = %package, peer = %peer_id, "dropping autocrypt key data: {}", e);
                return Ok(None);
            }
        };

        let key_id = bundle.key_id();
        if self.secrets.sealed_secret(key_id)?.is_some() {
            tracing::warn!(
                package = %package,
                peer = %peer_id,
                key_id = %key_id,
                "dropping autocrypt key data for one of the user's own keys"
            );
            return Ok(None);
        }

        let (key_id, stored) = self.keys.insert_public(&bundle)?;
        if !stored {
            tracing::debug!(package = %package, peer = %peer_id, key_id = %key_id, "key already known; stored copy kept");
        }
        Ok(Some(key_id))
    }

    fn usable(&self, key_id: Option<KeyId>) -> Result<Option<KeyId>> {
        let Some(key_id) = key_id else {
            return Ok(None);
        };
        let now = self.clock.unix_now();
        Ok(self
            .keys
            .public_key(key_id)?
            .filter(|key| key.is_usable_at(now))
            .map(|_| key_id))
    }

    /// Current recommendation for encrypting to `peer_id`.
    ///
    /// Precedence: fresh direct key (mutual, then available), then gossip,
    /// then a stale direct key, then disabled. Gossip never outranks a fresh
    /// direct key.
    pub fn classify(&self, package: &str, peer_id: &str) -> Result<PeerStatus> {
        let peer_id = normalize_peer_id(peer_id);
        let Some(peer) = self.peers.peer(package, &peer_id)? else {
            return Ok(PeerStatus::DISABLED);
        };
        self.classify_peer(&peer)
    }

    fn classify_peer(&self, peer: &AutocryptPeer) -> Result<PeerStatus> {
        let direct = self.usable(peer.trusted_key_id)?;
        let gossip = self.usable(peer.gossip_key_id)?;
        let stale = match (peer.last_seen, peer.last_seen_key) {
            (Some(seen), Some(seen_key)) => seen.saturating_sub(seen_key) > self.stale_after_secs,
            _ => false,
        };

        let status = match (direct, gossip) {
            (Some(key_id), _) if !stale => PeerStatus {
                recommendation: if peer.is_mutual {
                    Recommendation::Mutual
                } else {
                    Recommendation::Available
                },
                key_id: Some(key_id),
            },
            (_, Some(key_id)) => PeerStatus {
                recommendation: Recommendation::DiscouragedGossip,
                key_id: Some(key_id),
            },
            (Some(key_id), None) => PeerStatus {
                recommendation: Recommendation::DiscouragedOld,
                key_id: Some(key_id),
            },
            (None, None) => PeerStatus::DISABLED,
        };
        Ok(status)
    }

    /// Recommendations for a set of peers plus the weakest of them.
    pub fn status(&self, package: &str, peer_ids: &[String]) -> Result<AutocryptStatus> {
        let mut peers = BTreeMap::new();
        for peer_id in peer_ids {
            let status = self.classify(package, peer_id)?;
            peers.insert(normalize_peer_id(peer_id), status.recommendation);
        }
        let overall = peers
            .values()
            .copied()
            .min()
            .unwrap_or(Recommendation::Disabled);
        Ok(AutocryptStatus { overall, peers })
    }

    /// Forget a peer entirely. The only way timestamps ever go backwards.
    pub fn delete_peer(&self, package: &str, peer_id: &str) -> Result<bool> {
        let peer_id = normalize_peer_id(peer_id);
        self.locks
            .with_lock(package, &peer_id, || self.peers.delete_peer(package, &peer_id))
    }

    pub fn peer(&self, package: &str, peer_id: &str) -> Result<Option<AutocryptPeer>> {
        self.peers.peer(package, &normalize_peer_id(peer_id))
    }
}
