//! The crypto engine contract and its local implementation.

pub mod local;
pub mod message;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::interaction::{RequiredInput, SensitiveInput};
use crate::keys::KeyId;

pub use local::LocalEngine;
pub use message::{DetachedSignature, SealedMessage};

/// One cryptographic operation, fully resolved to concrete keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Sign {
        key_id: KeyId,
        data: Vec<u8>,
    },
    Encrypt {
        recipients: Vec<KeyId>,
        data: Vec<u8>,
        sign_with: Option<KeyId>,
    },
    DecryptVerify {
        data: Vec<u8>,
    },
    Backup {
        key_ids: Vec<KeyId>,
    },
}

/// Signature state of a decrypted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verification {
    Unsigned,
    Valid { signer: KeyId, created: u64 },
    /// Signed by a key the store does not know.
    UnknownSigner { signer: KeyId },
    /// Signed by a revoked key; the user chose to accept it anyway.
    RevokedSigner { signer: KeyId, created: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    Signature(DetachedSignature),
    /// Serialized [`SealedMessage`].
    Encrypted(Vec<u8>),
    Decrypted {
        data: Vec<u8>,
        verification: Verification,
    },
    /// Passphrase-sealed, ASCII-armored export.
    Backup(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub message: String,
}

/// Typed log of what went wrong inside the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLog {
    pub entries: Vec<LogEntry>,
}

impl OperationLog {
    pub fn error(message: impl Into<String>) -> Self {
        let mut log = Self::default();
        log.push(LogKind::Error, message);
        log
    }

    pub fn push(&mut self, kind: LogKind, message: impl Into<String>) {
        self.entries.push(LogEntry {
            kind,
            message: message.into(),
        });
    }
}

impl fmt::Display for OperationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut errors = self
            .entries
            .iter()
            .filter(|entry| entry.kind == LogKind::Error)
            .peekable();
        if errors.peek().is_none() {
            return write!(f, "unknown engine failure");
        }
        for (i, entry) in errors.enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", entry.message)?;
        }
        Ok(())
    }
}

/// What the engine made of one attempt at an operation.
#[derive(Debug)]
pub enum EngineResult {
    Success(OperationOutput),
    /// More input is needed. `state` carries everything gathered so far and
    /// is handed back on the next attempt.
    Pending {
        required: RequiredInput,
        state: SensitiveInput,
    },
    Failure {
        log: OperationLog,
    },
}

/// Performs the actual cryptography. Blocking; the dispatcher runs it off
/// the async executor.
pub trait CryptoEngine: Send + Sync {
    fn execute(&self, operation: &Operation, inputs: SensitiveInput) -> EngineResult;
}
