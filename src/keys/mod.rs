pub mod bundle;
pub mod identity;
pub mod store;

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 64-bit key identifier, rendered as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyId(u64);

impl KeyId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Key id from the leading 8 bytes of a digest.
    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(raw))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid key id '{0}': expected 16 hex digits")]
pub struct InvalidKeyId(String);

impl FromStr for KeyId {
    type Err = InvalidKeyId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches("0x");
        if trimmed.len() != 16 {
            return Err(InvalidKeyId(s.to_string()));
        }
        u64::from_str_radix(trimmed, 16)
            .map(Self)
            .map_err(|_| InvalidKeyId(s.to_string()))
    }
}

impl TryFrom<String> for KeyId {
    type Error = InvalidKeyId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyId> for String {
    fn from(id: KeyId) -> Self {
        id.to_string()
    }
}

fn user_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(?:[^<>]*<\s*([^<>\s]+@[^<>\s]+)\s*>|([^<>\s]+@[^<>\s]+))\s*$")
            .expect("user id pattern should compile")
    })
}

/// Reduce a user id or recipient string to its comparable address form.
///
/// `"Alice Example <Alice@Example.org>"` and `"alice@example.org"` both become
/// `"alice@example.org"`. Returns `None` when no address can be found.
pub fn canonical_address(user_id: &str) -> Option<String> {
    let captures = user_id_pattern().captures(user_id)?;
    let address = captures.get(1).or_else(|| captures.get(2))?;
    Some(address.as_str().to_lowercase())
}
