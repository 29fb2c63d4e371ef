//! Error types for PCM Core.
//!
//! `CoreError` is the single error surfaced by the stateful services. Errors
//! from `pcm-crypto` and the store convert into it with `?`.

use thiserror::Error;

use pcm_crypto::codec::{CodecError, Layer};
use pcm_crypto::commitment::CommitmentError;
use pcm_crypto::identity::KeyError;
use pcm_crypto::replay::ReplayError;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::types::MessageStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// No usable local identity.
    #[error("identity keys unavailable: {0}")]
    KeyUnavailable(String),

    #[error("contact not found: {0}")]
    ContactNotFound(String),

    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed at {0}")]
    DecryptionFailed(Layer),

    #[error("signature invalid")]
    SignatureInvalid,

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("message {message_id} already stored")]
    DuplicateMessage { message_id: String },

    #[error("replay rejected: {0}")]
    Replay(ReplayError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("message {message_id} is {status:?} and cannot be retried")]
    NotRetryable {
        message_id: String,
        status: MessageStatus,
    },
}

impl CoreError {
    /// Whether the caller can reasonably try again or fix its input.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CoreError::KeyUnavailable(_)
                | CoreError::EncryptionFailed(_)
                | CoreError::PersistenceFailed(_)
                | CoreError::InvalidConfig(_)
        )
    }
}

impl From<CodecError> for CoreError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::EncryptFailed(inner) => CoreError::EncryptionFailed(inner.to_string()),
            CodecError::DecryptFailed(layer) => CoreError::DecryptionFailed(layer),
            other => CoreError::InvalidEnvelope(other.to_string()),
        }
    }
}

impl From<KeyError> for CoreError {
    fn from(e: KeyError) -> Self {
        CoreError::InvalidKeyEncoding(e.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::PersistenceFailed(e.to_string())
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Store(inner) => CoreError::PersistenceFailed(inner.to_string()),
            other => CoreError::InvalidConfig(other.to_string()),
        }
    }
}

impl From<CommitmentError> for CoreError {
    fn from(e: CommitmentError) -> Self {
        CoreError::EncryptionFailed(e.to_string())
    }
}

impl From<ReplayError> for CoreError {
    fn from(e: ReplayError) -> Self {
        CoreError::Replay(e)
    }
}
