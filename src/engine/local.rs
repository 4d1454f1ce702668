use std::sync::Arc;

use age::secrecy::ExposeSecret;

use super::message::{DetachedSignature, SealedMessage};
use super::{CryptoEngine, EngineResult, LogKind, Operation, OperationLog, OperationOutput, Verification};
use crate::clock::Clock;
use crate::interaction::{RequiredInput, SensitiveInput};
use crate::keys::bundle::PublicKeyBundle;
use crate::keys::identity::{seal_with_passphrase, SecretKeyBundle, UnlockError};
use crate::keys::store::{KeyRepository, SecretKeyRepository};
use crate::keys::KeyId;

/// Why an attempt stopped short of a result.
enum Halt {
    Pending(RequiredInput),
    Failure(OperationLog),
}

impl Halt {
    fn failure(message: impl Into<String>) -> Self {
        Halt::Failure(OperationLog::error(message))
    }

    fn store(context: &str, err: anyhow::Error) -> Self {
        tracing::error!("{}: {:#}", context, err);
        Halt::failure(context.to_string())
    }
}

type Step<T> = Result<T, Halt>;

/// Engine over the local key store: age for encryption, ed25519 for
/// signatures, age scrypt for passphrase-protected secrets.
pub struct LocalEngine {
    keys: Arc<dyn KeyRepository>,
    secrets: Arc<dyn SecretKeyRepository>,
    clock: Arc<dyn Clock>,
}

impl LocalEngine {
    pub fn new(
        keys: Arc<dyn KeyRepository>,
        secrets: Arc<dyn SecretKeyRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys,
            secrets,
            clock,
        }
    }

    fn public_key(&self, key_id: KeyId) -> Step<PublicKeyBundle> {
        self.keys
            .public_key(key_id)
            .map_err(|e| Halt::store("failed to read key store", e))?
            .ok_or_else(|| Halt::failure(format!("key {} not found", key_id)))
    }

    fn usable_key(&self, key_id: KeyId) -> Step<PublicKeyBundle> {
        let key = self.public_key(key_id)?;
        if !key.is_usable_at(self.clock.unix_now()) {
            return Err(Halt::failure(format!("key {} is revoked or expired", key_id)));
        }
        Ok(key)
    }

    /// Unlock a secret key with the passphrase gathered so far. A wrong
    /// passphrase is dropped and asked for again.
    fn unlock(&self, key_id: KeyId, inputs: &mut SensitiveInput) -> Step<SecretKeyBundle> {
        let sealed = self
            .secrets
            .sealed_secret(key_id)
            .map_err(|e| Halt::store("failed to read secret key", e))?
            .ok_or_else(|| Halt::failure(format!("no secret key for {}", key_id)))?;

        let Some(passphrase) = inputs.passphrases.get(&key_id) else {
            return Err(Halt::Pending(RequiredInput::Passphrase {
                key_id,
                retry: false,
            }));
        };

        match SecretKeyBundle::unlock(&sealed, passphrase) {
            Ok(key) => Ok(key),
            Err(UnlockError::BadPassphrase) => {
                inputs.passphrases.remove(&key_id);
                tracing::info!(key_id = %key_id, "wrong passphrase");
                Err(Halt::Pending(RequiredInput::Passphrase {
                    key_id,
                    retry: true,
                }))
            }
            Err(e) => Err(Halt::failure(format!("cannot unlock {}: {}", key_id, e))),
        }
    }

    fn signature(&self, key_id: KeyId, data: &[u8], inputs: &mut SensitiveInput) -> Step<DetachedSignature> {
        self.usable_key(key_id)?;
        let key = self.unlock(key_id, inputs)?;
        let now = self.clock.unix_now();
        let created = *inputs.signature_time.get_or_insert(now);
        Ok(DetachedSignature::create(&key, data, created))
    }

    fn sign(&self, key_id: KeyId, data: &[u8], inputs: &mut SensitiveInput) -> Step<OperationOutput> {
        Ok(OperationOutput::Signature(self.signature(key_id, data, inputs)?))
    }

    fn encrypt(
        &self,
        recipients: &[KeyId],
        data: &[u8],
        sign_with: Option<KeyId>,
        inputs: &mut SensitiveInput,
    ) -> Step<OperationOutput> {
        if recipients.is_empty() {
            return Err(Halt::failure("no recipients"));
        }
        let keys = recipients
            .iter()
            .map(|key_id| self.usable_key(*key_id))
            .collect::<Step<Vec<_>>>()?;

        let signature = match sign_with {
            Some(key_id) => Some(self.signature(key_id, data, inputs)?),
            None => None,
        };

        let sealed = SealedMessage::seal(data, &keys, signature)
            .and_then(|message| message.to_bytes())
            .map_err(|e| Halt::failure(format!("{:#}", e)))?;
        Ok(OperationOutput::Encrypted(sealed))
    }

    fn decrypt_verify(&self, data: &[u8], inputs: &mut SensitiveInput) -> Step<OperationOutput> {
        let message = SealedMessage::from_bytes(data).map_err(|e| Halt::failure(format!("{:#}", e)))?;

        let own = self
            .secrets
            .list_secret()
            .map_err(|e| Halt::store("failed to list secret keys", e))?;
        let key_id = message
            .recipients
            .iter()
            .copied()
            .find(|id| own.contains(id))
            .ok_or_else(|| Halt::failure("message is not encrypted to any of our keys"))?;

        let key = self.unlock(key_id, inputs)?;
        let (plaintext, signature) = message
            .open(&key.age_identity)
            .map_err(|e| Halt::failure(format!("{:#}", e)))?;

        let verification = match signature {
            None => Verification::Unsigned,
            Some(signature) => self.verify(&signature, &plaintext, inputs)?,
        };
        Ok(OperationOutput::Decrypted {
            data: plaintext,
            verification,
        })
    }

    fn verify(
        &self,
        signature: &DetachedSignature,
        data: &[u8],
        inputs: &SensitiveInput,
    ) -> Step<Verification> {
        let signer = signature.signer;
        let Some(key) = self
            .keys
            .public_key(signer)
            .map_err(|e| Halt::store("failed to read key store", e))?
        else {
            return Ok(Verification::UnknownSigner { signer });
        };

        if let Err(e) = signature.verify(&key, data) {
            let mut log = OperationLog::default();
            log.push(LogKind::Info, format!("signed by {}", signer));
            log.push(LogKind::Error, format!("{:#}", e));
            return Err(Halt::Failure(log));
        }

        if key.revoked {
            if !inputs.acknowledged_warning {
                return Err(Halt::Pending(RequiredInput::SecurityWarning {
                    problem: format!("message is signed by revoked key {}", signer),
                    overridable: true,
                }));
            }
            return Ok(Verification::RevokedSigner {
                signer,
                created: signature.created,
            });
        }

        Ok(Verification::Valid {
            signer,
            created: signature.created,
        })
    }

    fn backup(&self, key_ids: &[KeyId], inputs: &mut SensitiveInput) -> Step<OperationOutput> {
        if key_ids.is_empty() {
            return Err(Halt::failure("no keys to back up"));
        }

        let mut export = String::new();
        for key_id in key_ids {
            let key = self.unlock(*key_id, inputs)?;
            export.push_str(key.to_secret_text().expose_secret());
            export.push('\n');
        }

        let Some(code) = &inputs.backup_code else {
            return Err(Halt::Pending(RequiredInput::BackupCode));
        };
        let sealed = seal_with_passphrase(export.as_bytes(), code)
            .map_err(|e| Halt::failure(format!("{:#}", e)))?;
        Ok(OperationOutput::Backup(sealed))
    }
}

impl CryptoEngine for LocalEngine {
    fn execute(&self, operation: &Operation, mut inputs: SensitiveInput) -> EngineResult {
        let outcome = match operation {
            Operation::Sign { key_id, data } => self.sign(*key_id, data, &mut inputs),
            Operation::Encrypt {
                recipients,
                data,
                sign_with,
            } => self.encrypt(recipients, data, *sign_with, &mut inputs),
            Operation::DecryptVerify { data } => self.decrypt_verify(data, &mut inputs),
            Operation::Backup { key_ids } => self.backup(key_ids, &mut inputs),
        };

        match outcome {
            Ok(output) => EngineResult::Success(output),
            Err(Halt::Pending(required)) => EngineResult::Pending {
                required,
                state: inputs,
            },
            Err(Halt::Failure(log)) => {
                tracing::debug!("engine failure: {}", log);
                EngineResult::Failure { log }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::identity::open_with_passphrase;
    use crate::keys::store::KeyStore;
    use age::secrecy::SecretString;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<KeyStore>,
        engine: LocalEngine,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KeyStore::open_at(dir.path().to_path_buf()));
        let clock = Arc::new(ManualClock::at_unix(5_000));
        let engine = LocalEngine::new(store.clone(), store.clone(), clock);
        Fixture {
            _dir: dir,
            store,
            engine,
        }
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    fn own_key(store: &KeyStore, uid: &str, passphrase: &str) -> SecretKeyBundle {
        let key = SecretKeyBundle::generate(vec![uid.to_string()], 1_000, None);
        store.save_public(&key.public()).unwrap();
        store
            .save_secret(key.key_id(), &key.seal(&secret(passphrase)).unwrap())
            .unwrap();
        key
    }

    fn with_passphrase(key_id: KeyId, passphrase: &str) -> SensitiveInput {
        let mut inputs = SensitiveInput::default();
        inputs.passphrases.insert(key_id, secret(passphrase));
        inputs
    }

    #[test]
    fn sign_asks_for_passphrase_then_signs() {
        let f = fixture();
        let key = own_key(&f.store, "me@x.org", "pw");
        let op = Operation::Sign {
            key_id: key.key_id(),
            data: b"doc".to_vec(),
        };

        let EngineResult::Pending { required, .. } = f.engine.execute(&op, SensitiveInput::default())
        else {
            panic!("expected pending");
        };
        assert_eq!(
            required,
            RequiredInput::Passphrase {
                key_id: key.key_id(),
                retry: false
            }
        );

        let EngineResult::Success(OperationOutput::Signature(sig)) =
            f.engine.execute(&op, with_passphrase(key.key_id(), "pw"))
        else {
            panic!("expected signature");
        };
        assert_eq!(sig.created, 5_000);
        sig.verify(&key.public(), b"doc").unwrap();
    }

    #[test]
    fn wrong_passphrase_is_asked_again() {
        let f = fixture();
        let key = own_key(&f.store, "me@x.org", "pw");
        let op = Operation::Sign {
            key_id: key.key_id(),
            data: b"doc".to_vec(),
        };

        let EngineResult::Pending { required, state } =
            f.engine.execute(&op, with_passphrase(key.key_id(), "nope"))
        else {
            panic!("expected pending");
        };
        assert_eq!(
            required,
            RequiredInput::Passphrase {
                key_id: key.key_id(),
                retry: true
            }
        );
        assert!(state.passphrases.is_empty());
    }

    #[test]
    fn encrypt_then_decrypt_with_signature() {
        let f = fixture();
        let me = own_key(&f.store, "me@x.org", "pw");
        let bob = SecretKeyBundle::generate(vec!["bob@x.org".to_string()], 1_000, None);
        f.store.save_public(&bob.public()).unwrap();

        let encrypt = Operation::Encrypt {
            recipients: vec![bob.key_id(), me.key_id()],
            data: b"hello bob".to_vec(),
            sign_with: Some(me.key_id()),
        };
        let EngineResult::Success(OperationOutput::Encrypted(sealed)) =
            f.engine.execute(&encrypt, with_passphrase(me.key_id(), "pw"))
        else {
            panic!("expected ciphertext");
        };

        let decrypt = Operation::DecryptVerify { data: sealed };
        let EngineResult::Success(OperationOutput::Decrypted { data, verification }) =
            f.engine.execute(&decrypt, with_passphrase(me.key_id(), "pw"))
        else {
            panic!("expected plaintext");
        };
        assert_eq!(data, b"hello bob");
        assert_eq!(
            verification,
            Verification::Valid {
                signer: me.key_id(),
                created: 5_000
            }
        );
    }

    #[test]
    fn revoked_signer_needs_acknowledgement() {
        let f = fixture();
        let me = own_key(&f.store, "me@x.org", "pw");
        let sender = SecretKeyBundle::generate(vec!["eve@x.org".to_string()], 1_000, None);
        let signature = DetachedSignature::create(&sender, b"hi", 10);
        let sealed = SealedMessage::seal(b"hi", &[me.public()], Some(signature))
            .unwrap()
            .to_bytes()
            .unwrap();

        let mut revoked = sender.public();
        revoked.revoked = true;
        f.store.save_public(&revoked).unwrap();

        let decrypt = Operation::DecryptVerify { data: sealed };
        let EngineResult::Pending { required, mut state } =
            f.engine.execute(&decrypt, with_passphrase(me.key_id(), "pw"))
        else {
            panic!("expected warning");
        };
        assert!(matches!(
            required,
            RequiredInput::SecurityWarning {
                overridable: true,
                ..
            }
        ));

        state.acknowledged_warning = true;
        let EngineResult::Success(OperationOutput::Decrypted { verification, .. }) =
            f.engine.execute(&decrypt, state)
        else {
            panic!("expected plaintext");
        };
        assert_eq!(
            verification,
            Verification::RevokedSigner {
                signer: sender.key_id(),
                created: 10
            }
        );
    }

    #[test]
    fn message_for_someone_else_fails() {
        let f = fixture();
        own_key(&f.store, "me@x.org", "pw");
        let bob = SecretKeyBundle::generate(vec!["bob@x.org".to_string()], 1_000, None);
        let sealed = SealedMessage::seal(b"hi", &[bob.public()], None)
            .unwrap()
            .to_bytes()
            .unwrap();

        let result = f
            .engine
            .execute(&Operation::DecryptVerify { data: sealed }, SensitiveInput::default());
        assert!(matches!(result, EngineResult::Failure { .. }));
    }

    #[test]
    fn backup_asks_for_code_and_exports_sealed() {
        let f = fixture();
        let key = own_key(&f.store, "me@x.org", "pw");
        let op = Operation::Backup {
            key_ids: vec![key.key_id()],
        };

        let EngineResult::Pending { required, mut state } =
            f.engine.execute(&op, with_passphrase(key.key_id(), "pw"))
        else {
            panic!("expected pending");
        };
        assert_eq!(required, RequiredInput::BackupCode);

        state.backup_code = Some(secret("1234-5678"));
        let EngineResult::Success(OperationOutput::Backup(armored)) = f.engine.execute(&op, state)
        else {
            panic!("expected backup");
        };
        assert!(String::from_utf8_lossy(&armored).contains("BEGIN AGE ENCRYPTED FILE"));

        let opened = open_with_passphrase(&armored, &secret("1234-5678")).unwrap();
        assert!(String::from_utf8(opened)
            .unwrap()
            .contains(&key.key_id().to_string()));
    }
}
