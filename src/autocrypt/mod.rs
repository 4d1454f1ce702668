//! Autocrypt peer state: what each calling app has learned about its peers'
//! keys from message headers, and how strongly encryption to them should be
//! recommended.

pub mod machine;
pub mod store;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::encoding::opt_base64;
use crate::keys::{canonical_address, KeyId};

pub use machine::Autocrypt;
pub use store::{AutocryptStore, PeerStore};

/// Stored state for one (package, peer) pair.
///
/// The direct fields (`last_seen`, `last_seen_key`, `trusted_key_id`,
/// `is_mutual`) and the gossip fields are independent sub-states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutocryptPeer {
    /// Effective date of the newest direct message from the peer.
    pub last_seen: Option<u64>,
    /// Effective date of the newest direct message that carried a key.
    pub last_seen_key: Option<u64>,
    pub trusted_key_id: Option<KeyId>,
    pub is_mutual: bool,
    pub last_seen_gossip: Option<u64>,
    pub gossip_key_id: Option<KeyId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferEncrypt {
    #[default]
    NoPreference,
    Mutual,
}

/// Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Disabled,
    DiscouragedOld,
    DiscouragedGossip,
    Available,
    Mutual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub recommendation: Recommendation,
    /// The key the recommendation refers to, absent when disabled.
    pub key_id: Option<KeyId>,
}

impl PeerStatus {
    pub const DISABLED: PeerStatus = PeerStatus {
        recommendation: Recommendation::Disabled,
        key_id: None,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutocryptStatus {
    /// Weakest recommendation over all requested peers.
    pub overall: Recommendation,
    pub peers: BTreeMap<String, Recommendation>,
}

/// An `Autocrypt:` header seen in a message sent by the peer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectUpdate {
    pub effective_date: u64,
    #[serde(default, with = "opt_base64", skip_serializing_if = "Option::is_none")]
    pub key_data: Option<Vec<u8>>,
    #[serde(default)]
    pub prefer_encrypt: PreferEncrypt,
}

/// An `Autocrypt-Gossip:` header: a third party vouching for the peer's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipUpdate {
    pub effective_date: u64,
    #[serde(default, with = "opt_base64", skip_serializing_if = "Option::is_none")]
    pub key_data: Option<Vec<u8>>,
}

/// What an update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "key_id", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Not newer than the stored state; nothing changed.
    Stale,
    /// Newer, but carried no key data.
    Seen,
    KeyUpdated(KeyId),
    /// Key data was unparsable or contained secret material and was dropped.
    KeyRejected,
}

/// Peer ids are compared in canonical address form where possible.
pub fn normalize_peer_id(peer_id: &str) -> String {
    canonical_address(peer_id).unwrap_or_else(|| peer_id.trim().to_lowercase())
}
