//! JSON-lines frames spoken on the gateway socket.

use age::secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::api::{ApiRequest, PendingInteraction};
use crate::continuation::TokenId;
use crate::encoding::base64_bytes;
use crate::error::{ApiError, ErrorBody};
use crate::interaction::UserInput;
use crate::keys::KeyId;

/// One line sent by a client.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFrame {
    /// A call from an application.
    Api(ApiRequest),
    /// The user's side of an interaction. Only accepted from the socket owner.
    Interaction(InteractionRequest),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InteractionRequest {
    Describe { token: TokenId },
    Complete { token: TokenId, input: WireUserInput },
    Cancel { token: TokenId },
}

/// [`UserInput`] as it travels on the socket.
#[derive(Serialize, Deserialize)]
#[serde(tag = "input", rename_all = "snake_case")]
pub enum WireUserInput {
    Approve,
    Deny,
    Passphrase { key_id: KeyId, passphrase: String },
    SelectKeys { key_ids: Vec<KeyId> },
    BackupCode { code: String },
    AcknowledgeWarning,
    SecurityTokenResponse {
        #[serde(with = "base64_bytes")]
        response: Vec<u8>,
    },
}

impl std::fmt::Debug for WireUserInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WireUserInput::Approve => "Approve",
            WireUserInput::Deny => "Deny",
            WireUserInput::Passphrase { .. } => "Passphrase",
            WireUserInput::SelectKeys { .. } => "SelectKeys",
            WireUserInput::BackupCode { .. } => "BackupCode",
            WireUserInput::AcknowledgeWarning => "AcknowledgeWarning",
            WireUserInput::SecurityTokenResponse { .. } => "SecurityTokenResponse",
        };
        f.write_str(name)
    }
}

impl From<WireUserInput> for UserInput {
    fn from(input: WireUserInput) -> Self {
        match input {
            WireUserInput::Approve => UserInput::Approve,
            WireUserInput::Deny => UserInput::Deny,
            WireUserInput::Passphrase { key_id, passphrase } => UserInput::Passphrase {
                key_id,
                passphrase: SecretString::from(passphrase),
            },
            WireUserInput::SelectKeys { key_ids } => UserInput::SelectKeys(key_ids),
            WireUserInput::BackupCode { code } => UserInput::BackupCode(SecretString::from(code)),
            WireUserInput::AcknowledgeWarning => UserInput::AcknowledgeWarning,
            WireUserInput::SecurityTokenResponse { response } => {
                UserInput::SecurityTokenResponse(response)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InteractionResponse {
    Pending(PendingInteraction),
    Completed { token: TokenId },
    Cancelled { existed: bool },
    Failed(ErrorBody),
}

impl InteractionResponse {
    /// The socket owner is the user, so failures carry the full detail.
    pub fn failed(err: &ApiError) -> Self {
        InteractionResponse::Failed(ErrorBody {
            code: err.code(),
            message: err.to_string(),
        })
    }
}
