use std::fmt;

use base64::Engine;
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

use super::{canonical_address, KeyId};

/// Marker every age secret key starts with.
const AGE_SECRET_PREFIX: &str = "AGE-SECRET-KEY-";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("key data is not valid UTF-8")]
    NotUtf8,
    #[error("key data contains secret key material")]
    ContainsSecretMaterial,
    #[error("missing '{0}:' line in key data")]
    Missing(&'static str),
    #[error("invalid '{field}' in key data: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A public key bundle: X25519 (age) encryption key + ed25519 signing key,
/// with the identity claims and validity window attached to them.
///
/// Text format:
/// ```text
/// # pgpgate public key 0123456789abcdef
/// # fingerprint: SHA256:...
/// uid: Alice <alice@example.org>
/// age: age1...
/// sign: ed25519:<base64>
/// created: 1700000000
/// expires: 1800000000
/// revoked: true
/// ```
#[derive(Clone)]
pub struct PublicKeyBundle {
    pub user_ids: Vec<String>,
    pub age_recipient: age::x25519::Recipient,
    pub verifying_key: VerifyingKey,
    pub created: u64,
    pub expires: Option<u64>,
    pub revoked: bool,
}

impl fmt::Debug for PublicKeyBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeyBundle")
            .field("key_id", &self.key_id())
            .field("user_ids", &self.user_ids)
            .field("created", &self.created)
            .field("expires", &self.expires)
            .field("revoked", &self.revoked)
            .finish()
    }
}

/// Raw `key: value` fields of a bundle, before any key parsing.
#[derive(Default)]
pub(crate) struct BundleFields {
    pub user_ids: Vec<String>,
    pub age: Option<String>,
    pub sign: Option<String>,
    pub created: Option<String>,
    pub expires: Option<String>,
    pub revoked: bool,
    pub age_secret: Option<String>,
    pub sign_secret: Option<String>,
}

pub(crate) fn parse_fields(text: &str) -> Result<BundleFields, BundleError> {
    let mut fields = BundleFields::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        match name.trim() {
            "uid" => fields.user_ids.push(value),
            "age" => fields.age = Some(value),
            "sign" => fields.sign = Some(value),
            "created" => fields.created = Some(value),
            "expires" => fields.expires = Some(value),
            "revoked" => fields.revoked = value == "true",
            "age-secret" => fields.age_secret = Some(value),
            "sign-secret" => fields.sign_secret = Some(value),
            _ => {}
        }
    }

    Ok(fields)
}

impl BundleFields {
    pub(crate) fn has_secret_material(&self) -> bool {
        self.age_secret.is_some() || self.sign_secret.is_some()
    }

    /// Build the public half from parsed fields.
    pub(crate) fn into_public(self) -> Result<PublicKeyBundle, BundleError> {
        let age_str = self.age.ok_or(BundleError::Missing("age"))?;
        let sign_str = self.sign.ok_or(BundleError::Missing("sign"))?;
        let created_str = self.created.ok_or(BundleError::Missing("created"))?;

        let age_recipient: age::x25519::Recipient =
            age_str.parse().map_err(|e: &str| BundleError::Invalid {
                field: "age",
                reason: e.to_string(),
            })?;

        let sign_b64 = sign_str
            .strip_prefix("ed25519:")
            .ok_or_else(|| BundleError::Invalid {
                field: "sign",
                reason: "expected 'ed25519:' prefix".to_string(),
            })?;
        let verifying_key = decode_verifying_key(sign_b64)?;

        let created = parse_timestamp("created", &created_str)?;
        let expires = self
            .expires
            .as_deref()
            .map(|s| parse_timestamp("expires", s))
            .transpose()?;

        if self.user_ids.is_empty() {
            return Err(BundleError::Missing("uid"));
        }

        Ok(PublicKeyBundle {
            user_ids: self.user_ids,
            age_recipient,
            verifying_key,
            created,
            expires,
            revoked: self.revoked,
        })
    }
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<u64, BundleError> {
    value.parse().map_err(|_| BundleError::Invalid {
        field,
        reason: format!("'{}' is not a unix timestamp", value),
    })
}

fn decode_verifying_key(b64: &str) -> Result<VerifyingKey, BundleError> {
    let invalid = |reason: String| BundleError::Invalid {
        field: "sign",
        reason,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| invalid(e.to_string()))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| invalid("invalid ed25519 public key length".to_string()))?;
    VerifyingKey::from_bytes(&array).map_err(|e| invalid(e.to_string()))
}

impl PublicKeyBundle {
    /// Parse key data that must contain public material only.
    ///
    /// Anything carrying secret key material is refused outright, even if the
    /// public half would parse.
    pub fn parse_public(data: &[u8]) -> Result<Self, BundleError> {
        let text = std::str::from_utf8(data).map_err(|_| BundleError::NotUtf8)?;
        if text.to_ascii_uppercase().contains(AGE_SECRET_PREFIX) {
            return Err(BundleError::ContainsSecretMaterial);
        }
        let fields = parse_fields(text)?;
        if fields.has_secret_material() {
            return Err(BundleError::ContainsSecretMaterial);
        }
        fields.into_public()
    }

    pub fn key_id(&self) -> KeyId {
        KeyId::from_digest(&self.digest())
    }

    /// SHA-256 fingerprint over the encryption and signing public keys.
    pub fn fingerprint(&self) -> String {
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD.encode(&self.digest()[..16])
        )
    }

    pub fn sign_pubkey_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.verifying_key.to_bytes())
    }

    fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.age_recipient.to_string().as_bytes());
        hasher.update(self.sign_pubkey_b64().as_bytes());
        hasher.finalize().into()
    }

    /// Whether the key may be used for new operations at `now`.
    pub fn is_usable_at(&self, now: u64) -> bool {
        !self.revoked && self.expires.map_or(true, |expires| now < expires)
    }

    /// Canonical addresses claimed by this key's user ids.
    pub fn addresses(&self) -> Vec<String> {
        self.user_ids
            .iter()
            .filter_map(|uid| canonical_address(uid))
            .collect()
    }

    pub fn claims_address(&self, address: &str) -> bool {
        self.user_ids
            .iter()
            .filter_map(|uid| canonical_address(uid))
            .any(|a| a == address)
    }

    /// Fold a newer copy of the same key into this one. Revocation is sticky
    /// and user ids accumulate.
    pub fn merge(&mut self, other: &PublicKeyBundle) {
        for uid in &other.user_ids {
            if !self.user_ids.contains(uid) {
                self.user_ids.push(uid.clone());
            }
        }
        self.revoked |= other.revoked;
        if other.expires.is_some() {
            self.expires = other.expires;
        }
    }

    /// Render the bundle in its text form.
    pub fn to_text(&self) -> String {
        let mut out = format!(
            "# pgpgate public key {}\n# fingerprint: {}\n",
            self.key_id(),
            self.fingerprint()
        );
        self.write_public_fields(&mut out);
        out
    }

    pub(crate) fn write_public_fields(&self, out: &mut String) {
        for uid in &self.user_ids {
            out.push_str(&format!("uid: {}\n", uid));
        }
        out.push_str(&format!("age: {}\n", self.age_recipient));
        out.push_str(&format!("sign: ed25519:{}\n", self.sign_pubkey_b64()));
        out.push_str(&format!("created: {}\n", self.created));
        if let Some(expires) = self.expires {
            out.push_str(&format!("expires: {}\n", expires));
        }
        if self.revoked {
            out.push_str("revoked: true\n");
        }
    }
}
