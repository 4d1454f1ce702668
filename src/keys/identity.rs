use std::io::{Read, Write};

use age::secrecy::{ExposeSecret, SecretString};
use anyhow::{Context, Result};
use base64::Engine;
use ed25519_dalek::SigningKey;

use super::bundle::{parse_fields, BundleError, PublicKeyBundle};
use super::KeyId;

#[derive(Debug, thiserror::Error)]
pub enum UnlockError {
    #[error("wrong passphrase")]
    BadPassphrase,
    #[error("secret key data is corrupt: {0}")]
    Corrupt(String),
}

/// A complete secret key: age X25519 identity (decryption) + ed25519 signing key.
///
/// Only ever held in memory after [`SecretKeyBundle::unlock`]; at rest it is
/// sealed with the owner's passphrase.
pub struct SecretKeyBundle {
    pub user_ids: Vec<String>,
    pub age_identity: age::x25519::Identity,
    pub signing_key: SigningKey,
    pub created: u64,
    pub expires: Option<u64>,
}

impl SecretKeyBundle {
    /// Generate a new keypair.
    pub fn generate(user_ids: Vec<String>, created: u64, expires: Option<u64>) -> Self {
        let age_identity = age::x25519::Identity::generate();
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            user_ids,
            age_identity,
            signing_key,
            created,
            expires,
        }
    }

    /// The public half of this key.
    pub fn public(&self) -> PublicKeyBundle {
        PublicKeyBundle {
            user_ids: self.user_ids.clone(),
            age_recipient: self.age_identity.to_public(),
            verifying_key: self.signing_key.verifying_key(),
            created: self.created,
            expires: self.expires,
            revoked: false,
        }
    }

    pub fn key_id(&self) -> KeyId {
        self.public().key_id()
    }

    /// Full text form including secret lines. Never written to disk unsealed.
    pub(crate) fn to_secret_text(&self) -> SecretString {
        let public = self.public();
        let mut out = format!("# pgpgate secret key {}\n", public.key_id());
        public.write_public_fields(&mut out);
        out.push_str(&format!(
            "age-secret: {}\n",
            self.age_identity.to_string().expose_secret()
        ));
        out.push_str(&format!(
            "sign-secret: ed25519:{}\n",
            base64::engine::general_purpose::STANDARD.encode(self.signing_key.to_bytes())
        ));
        SecretString::from(out)
    }

    pub(crate) fn parse_secret_text(text: &str) -> Result<Self, BundleError> {
        let fields = parse_fields(text)?;
        let age_secret = fields
            .age_secret
            .clone()
            .ok_or(BundleError::Missing("age-secret"))?;
        let sign_secret = fields
            .sign_secret
            .clone()
            .ok_or(BundleError::Missing("sign-secret"))?;
        let public = fields.into_public()?;

        let age_identity: age::x25519::Identity =
            age_secret.parse().map_err(|e: &str| BundleError::Invalid {
                field: "age-secret",
                reason: e.to_string(),
            })?;

        let invalid_sign = |reason: String| BundleError::Invalid {
            field: "sign-secret",
            reason,
        };
        let sign_b64 = sign_secret
            .strip_prefix("ed25519:")
            .ok_or_else(|| invalid_sign("expected 'ed25519:' prefix".to_string()))?;
        let sign_bytes = base64::engine::general_purpose::STANDARD
            .decode(sign_b64)
            .map_err(|e| invalid_sign(e.to_string()))?;
        let sign_array: [u8; 32] = sign_bytes
            .try_into()
            .map_err(|_| invalid_sign("invalid signing key length".to_string()))?;
        let signing_key = SigningKey::from_bytes(&sign_array);

        let bundle = Self {
            user_ids: public.user_ids.clone(),
            age_identity,
            signing_key,
            created: public.created,
            expires: public.expires,
        };
        if bundle.key_id() != public.key_id() {
            return Err(invalid_sign(
                "secret keys do not match the public keys".to_string(),
            ));
        }
        Ok(bundle)
    }

    /// Seal this key with a passphrase (age scrypt, ASCII-armored).
    pub fn seal(&self, passphrase: &SecretString) -> Result<Vec<u8>> {
        let secret_text = self.to_secret_text();
        seal_with_passphrase(secret_text.expose_secret().as_bytes(), passphrase)
    }

    /// Open a sealed key with its passphrase.
    pub fn unlock(sealed: &[u8], passphrase: &SecretString) -> Result<Self, UnlockError> {
        let plaintext = open_with_passphrase(sealed, passphrase)?;
        let text = String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|_| UnlockError::Corrupt("secret key is not valid UTF-8".to_string()))?;
        Self::parse_secret_text(text.expose_secret())
            .map_err(|e| UnlockError::Corrupt(e.to_string()))
    }
}

/// Encrypt bytes to a passphrase with age's scrypt recipient, armored.
pub(crate) fn seal_with_passphrase(data: &[u8], passphrase: &SecretString) -> Result<Vec<u8>> {
    let encryptor = age::Encryptor::with_user_passphrase(SecretString::from(
        passphrase.expose_secret().to_owned(),
    ));

    let mut sealed = vec![];
    let armor = age::armor::ArmoredWriter::wrap_output(&mut sealed, age::armor::Format::AsciiArmor)
        .context("failed to create armored writer")?;
    let mut writer = encryptor
        .wrap_output(armor)
        .context("failed to create age encryptor")?;
    writer
        .write_all(data)
        .context("failed to write sealed data")?;
    writer
        .finish()
        .and_then(|armor| armor.finish())
        .context("failed to finalize sealed data")?;

    Ok(sealed)
}

/// Decrypt armored passphrase-sealed bytes.
pub(crate) fn open_with_passphrase(
    sealed: &[u8],
    passphrase: &SecretString,
) -> Result<Vec<u8>, UnlockError> {
    let decryptor = age::Decryptor::new(age::armor::ArmoredReader::new(sealed))
        .map_err(|e| UnlockError::Corrupt(e.to_string()))?;
    let identity =
        age::scrypt::Identity::new(SecretString::from(passphrase.expose_secret().to_owned()));

    let mut reader = decryptor
        .decrypt(std::iter::once(&identity as &dyn age::Identity))
        .map_err(|e| match e {
            age::DecryptError::DecryptionFailed
            | age::DecryptError::KeyDecryptionFailed
            | age::DecryptError::NoMatchingKeys => {
                UnlockError::BadPassphrase
            }
            other => UnlockError::Corrupt(other.to_string()),
        })?;

    let mut plaintext = vec![];
    reader
        .read_to_end(&mut plaintext)
        .map_err(|e| UnlockError::Corrupt(e.to_string()))?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passphrase(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn secret_text_round_trip() {
        let key = SecretKeyBundle::generate(vec!["a@x.org".to_string()], 100, Some(200));
        let text = key.to_secret_text();
        let parsed = SecretKeyBundle::parse_secret_text(text.expose_secret()).unwrap();
        assert_eq!(parsed.key_id(), key.key_id());
        assert_eq!(parsed.expires, Some(200));
        assert_eq!(
            parsed.signing_key.verifying_key().to_bytes(),
            key.signing_key.verifying_key().to_bytes()
        );
    }

    #[test]
    fn seal_and_unlock() {
        let key = SecretKeyBundle::generate(vec!["a@x.org".to_string()], 100, None);
        let sealed = key.seal(&passphrase("correct horse")).unwrap();
        assert!(String::from_utf8_lossy(&sealed).contains("BEGIN AGE ENCRYPTED FILE"));
        assert!(!String::from_utf8_lossy(&sealed).contains("AGE-SECRET-KEY-"));

        let unlocked = SecretKeyBundle::unlock(&sealed, &passphrase("correct horse")).unwrap();
        assert_eq!(unlocked.key_id(), key.key_id());

        let err = SecretKeyBundle::unlock(&sealed, &passphrase("wrong")).err().unwrap();
        assert!(matches!(err, UnlockError::BadPassphrase));
    }
}
