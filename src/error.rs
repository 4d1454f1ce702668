use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationNotFound;
use crate::engine::OperationLog;
use crate::keys::KeyId;

/// Everything a gateway call can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Trust
    #[error("calling application is not registered")]
    NotRegistered,
    #[error("calling application's signing certificate does not match its registration")]
    CertificateMismatch,
    #[error("key {0} is not permitted for this application")]
    KeyNotPermitted(KeyId),

    // Resolution
    #[error("no recipients or key ids given")]
    NoIdentifiersOrKeys,
    #[error("keys are missing for some recipients and encryption is opportunistic")]
    OpportunisticMissingKeys,
    #[error("key {0} not found")]
    KeyNotFound(KeyId),

    // Protocol
    #[error(transparent)]
    ContinuationNotFound(#[from] ContinuationNotFound),
    #[error("unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("input does not answer the pending interaction")]
    InputMismatch,
    #[error("interaction was denied by the user")]
    Denied,

    // Collaborators
    #[error("operation failed: {0}")]
    Engine(OperationLog),
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(&'static str),
}

/// Machine-readable error code carried in the response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Any trust failure; the detail is only shown to the user.
    NoPermission,
    NoIdentifiersOrKeys,
    OpportunisticMissingKeys,
    KeyNotFound,
    ContinuationNotFound,
    UnsupportedAction,
    InputMismatch,
    Cancelled,
    OperationFailed,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::NotRegistered
            | ApiError::CertificateMismatch
            | ApiError::KeyNotPermitted(_) => ErrorCode::NoPermission,
            ApiError::NoIdentifiersOrKeys => ErrorCode::NoIdentifiersOrKeys,
            ApiError::OpportunisticMissingKeys => ErrorCode::OpportunisticMissingKeys,
            ApiError::KeyNotFound(_) => ErrorCode::KeyNotFound,
            ApiError::ContinuationNotFound(_) => ErrorCode::ContinuationNotFound,
            ApiError::UnsupportedAction(_) => ErrorCode::UnsupportedAction,
            ApiError::InputMismatch => ErrorCode::InputMismatch,
            ApiError::Denied => ErrorCode::Cancelled,
            ApiError::Engine(_) => ErrorCode::OperationFailed,
            ApiError::Store(_) | ApiError::InvariantViolation(_) => ErrorCode::Internal,
        }
    }

    /// Envelope body for the calling application. Trust failures are
    /// collapsed to one message so the caller cannot probe trust state.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self.code() {
            ErrorCode::NoPermission => "not permitted".to_string(),
            ErrorCode::Internal => "internal error".to_string(),
            _ => self.to_string(),
        };
        ErrorBody {
            code: self.code(),
            message,
        }
    }
}
