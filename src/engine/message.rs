use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use base64::Engine;
use ed25519_dalek::{Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoding::base64_bytes;
use crate::keys::bundle::PublicKeyBundle;
use crate::keys::identity::SecretKeyBundle;
use crate::keys::KeyId;

const MESSAGE_VERSION: u32 = 1;

/// An ed25519 signature over a message digest and its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSignature {
    pub signer: KeyId,
    pub created: u64,
    /// Base64 ed25519 signature.
    pub signature: String,
}

impl DetachedSignature {
    pub fn create(key: &SecretKeyBundle, data: &[u8], created: u64) -> Self {
        let signature = key.signing_key.sign(&signed_bytes(data, created));
        Self {
            signer: key.key_id(),
            created,
            signature: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
        }
    }

    /// Check the signature against `key`, which must be the signer's.
    pub fn verify(&self, key: &PublicKeyBundle, data: &[u8]) -> Result<()> {
        if key.key_id() != self.signer {
            bail!("signature was made by {}, not {}", self.signer, key.key_id());
        }
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.signature)
            .context("invalid signature encoding")?;
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid signature length"))?;
        let signature = Signature::from_bytes(&sig_array);

        key.verifying_key
            .verify(&signed_bytes(data, self.created), &signature)
            .map_err(|_| anyhow::anyhow!("signature verification failed: data may be tampered"))
    }
}

fn signed_bytes(data: &[u8], created: u64) -> Vec<u8> {
    let mut bytes = Sha256::digest(data).to_vec();
    bytes.extend_from_slice(&created.to_be_bytes());
    bytes
}

/// Plaintext inside a sealed message. The signature travels encrypted so the
/// signer is not visible to outsiders.
#[derive(Serialize, Deserialize)]
struct SealedContent {
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
    signature: Option<DetachedSignature>,
}

/// An encrypted, optionally signed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    pub version: u32,
    /// Key ids the message is encrypted to.
    pub recipients: Vec<KeyId>,
    /// age ciphertext of the JSON-serialized content.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl SealedMessage {
    /// Encrypt `data` (and an optional signature over it) to every recipient.
    pub fn seal(
        data: &[u8],
        recipients: &[PublicKeyBundle],
        signature: Option<DetachedSignature>,
    ) -> Result<Self> {
        let content = SealedContent {
            data: data.to_vec(),
            signature,
        };
        let plaintext = serde_json::to_vec(&content).context("failed to serialize message")?;
        let age_recipients: Vec<&age::x25519::Recipient> =
            recipients.iter().map(|key| &key.age_recipient).collect();

        Ok(Self {
            version: MESSAGE_VERSION,
            recipients: recipients.iter().map(PublicKeyBundle::key_id).collect(),
            ciphertext: age_encrypt_multi(&plaintext, &age_recipients)?,
        })
    }

    /// Decrypt with one of the recipients' identities.
    pub fn open(&self, identity: &age::x25519::Identity) -> Result<(Vec<u8>, Option<DetachedSignature>)> {
        let plaintext = age_decrypt(&self.ciphertext, identity)?;
        let content: SealedContent =
            serde_json::from_slice(&plaintext).context("decrypted message is malformed")?;
        Ok((content.data, content.signature))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("failed to serialize sealed message")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let message: Self =
            serde_json::from_slice(data).context("failed to parse sealed message")?;
        if message.version != MESSAGE_VERSION {
            bail!("unsupported message version {}", message.version);
        }
        Ok(message)
    }
}

/// Encrypt data with age to one or more recipients.
fn age_encrypt_multi(data: &[u8], recipients: &[&age::x25519::Recipient]) -> Result<Vec<u8>> {
    let recipients_iter = recipients.iter().map(|r| *r as &dyn age::Recipient);
    let encryptor =
        age::Encryptor::with_recipients(recipients_iter).context("no recipients to encrypt to")?;

    let mut encrypted = vec![];
    let mut writer = encryptor
        .wrap_output(&mut encrypted)
        .context("failed to create age encryptor")?;
    writer
        .write_all(data)
        .context("failed to write age ciphertext")?;
    writer
        .finish()
        .context("failed to finalize age encryption")?;

    Ok(encrypted)
}

fn age_decrypt(ciphertext: &[u8], identity: &age::x25519::Identity) -> Result<Vec<u8>> {
    let decryptor = age::Decryptor::new(ciphertext).context("failed to read age header")?;

    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| anyhow::anyhow!("age decryption failed: {}", e))?;

    let mut plaintext = vec![];
    reader
        .read_to_end(&mut plaintext)
        .context("failed to read decrypted data")?;

    Ok(plaintext)
}
