//! What a paused operation needs from the user, and what the user answers.

use std::collections::HashMap;

use age::secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::keys::KeyId;

/// Detailed description of the step the user has to take. Shown by the UI
/// collaborator; the calling app only ever sees the coarse
/// [`InteractionKind`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequiredInput {
    /// Allow an unknown app to use the gateway.
    Registration { package: String, fingerprint: String },
    /// The app is registered with different certificate bytes. Cannot be
    /// approved.
    CertificateMismatch { package: String },
    /// Allow the app to use one of the user's secret keys.
    KeyPermission { key_id: KeyId },
    /// Recipient resolution was ambiguous or incomplete.
    KeyChoice {
        found: Vec<KeyId>,
        missing: Vec<String>,
        duplicate: Vec<String>,
    },
    SigningKeyChoice { candidates: Vec<KeyId> },
    Passphrase { key_id: KeyId, retry: bool },
    SecurityToken { key_id: KeyId },
    SecurityWarning { problem: String, overridable: bool },
    BackupCode,
}

/// Coarse interaction category exposed to the calling app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    CallerApproval,
    KeyChoice,
    Passphrase,
    SecurityToken,
    SecurityWarning,
    BackupCode,
}

impl RequiredInput {
    pub fn kind(&self) -> InteractionKind {
        match self {
            RequiredInput::Registration { .. }
            | RequiredInput::CertificateMismatch { .. }
            | RequiredInput::KeyPermission { .. } => InteractionKind::CallerApproval,
            RequiredInput::KeyChoice { .. } | RequiredInput::SigningKeyChoice { .. } => {
                InteractionKind::KeyChoice
            }
            RequiredInput::Passphrase { .. } => InteractionKind::Passphrase,
            RequiredInput::SecurityToken { .. } => InteractionKind::SecurityToken,
            RequiredInput::SecurityWarning { .. } => InteractionKind::SecurityWarning,
            RequiredInput::BackupCode => InteractionKind::BackupCode,
        }
    }
}

/// The user's answer to a [`RequiredInput`].
#[derive(Debug)]
pub enum UserInput {
    Approve,
    Deny,
    Passphrase {
        key_id: KeyId,
        passphrase: SecretString,
    },
    SelectKeys(Vec<KeyId>),
    BackupCode(SecretString),
    AcknowledgeWarning,
    SecurityTokenResponse(Vec<u8>),
}

/// Input accumulated across the steps of one operation.
///
/// Carried inside the continuation payload and handed to the engine by
/// value. Secrets are zeroized on drop and redacted in `Debug`.
#[derive(Debug, Default)]
pub struct SensitiveInput {
    pub passphrases: HashMap<KeyId, SecretString>,
    pub backup_code: Option<SecretString>,
    /// Keys the user picked to settle an ambiguous resolution.
    pub selected_keys: Option<Vec<KeyId>>,
    pub signing_key: Option<KeyId>,
    pub acknowledged_warning: bool,
    /// Signature creation time, fixed on first use so a replay signs the
    /// same thing.
    pub signature_time: Option<u64>,
    pub security_token_response: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_looks_like_any_approval_to_the_app() {
        let mismatch = RequiredInput::CertificateMismatch {
            package: "org.example.mail".to_string(),
        };
        let registration = RequiredInput::Registration {
            package: "org.example.mail".to_string(),
            fingerprint: "ab".to_string(),
        };
        assert_eq!(mismatch.kind(), registration.kind());
    }

    #[test]
    fn required_input_is_tagged_json() {
        let json = serde_json::to_value(RequiredInput::Passphrase {
            key_id: KeyId::new(0xab),
            retry: false,
        })
        .unwrap();
        assert_eq!(json["kind"], "passphrase");
        assert_eq!(json["key_id"], "00000000000000ab");
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let mut input = SensitiveInput::default();
        input
            .passphrases
            .insert(KeyId::new(1), SecretString::from("hunter2".to_string()));
        assert!(!format!("{:?}", input).contains("hunter2"));
    }
}
