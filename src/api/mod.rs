//! Request and response types of the gateway API.

pub mod dispatcher;

use serde::{Deserialize, Serialize};

use crate::autocrypt::{AutocryptStatus, DirectUpdate, GossipUpdate, Recommendation, UpdateOutcome};
use crate::continuation::TokenId;
use crate::encoding::base64_bytes;
use crate::engine::{DetachedSignature, Verification};
use crate::error::{ApiError, ErrorBody};
use crate::interaction::InteractionKind;
use crate::keys::KeyId;

pub use dispatcher::{Collaborators, Gateway, PendingInteraction};

/// One call from an application. Resubmissions after a user interaction
/// carry the continuation token they were given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<TokenId>,
    #[serde(flatten)]
    pub action: Action,
}

impl ApiRequest {
    pub fn new(action: Action) -> Self {
        Self {
            continuation: None,
            action,
        }
    }

    pub fn resume(token: TokenId, action: Action) -> Self {
        Self {
            continuation: Some(token),
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CheckPermission,
    GetKeyIds {
        identifiers: Vec<String>,
        #[serde(default)]
        opportunistic: bool,
    },
    GetKey {
        key_id: KeyId,
    },
    Sign {
        #[serde(default)]
        key_id: Option<KeyId>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Encrypt {
        #[serde(default)]
        identifiers: Vec<String>,
        #[serde(default)]
        key_ids: Vec<KeyId>,
        #[serde(default)]
        opportunistic: bool,
        /// Also sign, with `signing_key` or the user's own key.
        #[serde(default)]
        sign: bool,
        #[serde(default)]
        signing_key: Option<KeyId>,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    DecryptVerify {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    AutocryptStatus {
        peers: Vec<String>,
    },
    UpdateAutocryptPeer {
        peer_id: String,
        #[serde(default)]
        direct: Option<DirectUpdate>,
        #[serde(default)]
        gossip: Vec<GossipUpdate>,
    },
    Backup {
        key_ids: Vec<KeyId>,
    },
}

/// Which action a continuation belongs to. A token is only valid for a
/// resubmission of the same action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CheckPermission,
    GetKeyIds,
    GetKey,
    Sign,
    Encrypt,
    DecryptVerify,
    AutocryptStatus,
    UpdateAutocryptPeer,
    Backup,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::CheckPermission => ActionKind::CheckPermission,
            Action::GetKeyIds { .. } => ActionKind::GetKeyIds,
            Action::GetKey { .. } => ActionKind::GetKey,
            Action::Sign { .. } => ActionKind::Sign,
            Action::Encrypt { .. } => ActionKind::Encrypt,
            Action::DecryptVerify { .. } => ActionKind::DecryptVerify,
            Action::AutocryptStatus { .. } => ActionKind::AutocryptStatus,
            Action::UpdateAutocryptPeer { .. } => ActionKind::UpdateAutocryptPeer,
            Action::Backup { .. } => ActionKind::Backup,
        }
    }
}

/// Action-specific payload of a successful call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiResult {
    Permitted,
    KeyIds {
        key_ids: Vec<KeyId>,
        recommendation: Recommendation,
    },
    Key {
        key_id: KeyId,
        /// Public bundle in text form.
        key: String,
    },
    Signature {
        signature: DetachedSignature,
    },
    Encrypted {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        recommendation: Recommendation,
    },
    Decrypted {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        verification: Verification,
    },
    AutocryptStatus(AutocryptStatus),
    AutocryptUpdated {
        direct: Option<UpdateOutcome>,
        gossip: Vec<UpdateOutcome>,
    },
    Backup {
        /// ASCII-armored, sealed with the backup code.
        armored: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    Success,
    UserInteractionRequired,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationDescriptor {
    pub token: TokenId,
    pub kind: InteractionKind,
}

/// What the calling app gets back. Exactly one of `continuation`, `error`
/// and `result` is set, according to `result_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub result_code: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<ContinuationDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ApiResult>,
}

impl ResponseEnvelope {
    pub fn success(result: ApiResult) -> Self {
        Self {
            result_code: ResultCode::Success,
            continuation: None,
            error: None,
            result: Some(result),
        }
    }

    pub fn interaction(token: TokenId, kind: InteractionKind) -> Self {
        Self {
            result_code: ResultCode::UserInteractionRequired,
            continuation: Some(ContinuationDescriptor { token, kind }),
            error: None,
            result: None,
        }
    }

    pub fn error(err: &ApiError) -> Self {
        Self {
            result_code: ResultCode::Error,
            continuation: None,
            error: Some(err.to_body()),
            result: None,
        }
    }
}
