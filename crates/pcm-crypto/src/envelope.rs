//! Versioned JSON wire envelope.
//!
//! Byte fields travel as standard base64. Decoding back into a
//! [`CiphertextEnvelope`] enforces exact lengths and refuses envelopes that
//! lack either nonce or the ephemeral key, so nothing half-formed ever
//! reaches the codec.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::codec::{CiphertextEnvelope, CodecError};
use crate::commitment::{Commitment, SubjectKind};

/// Current wire format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Message type for plain text chat.
pub const MESSAGE_TYPE_TEXT: &str = "text";

/// Wire form of a [`Commitment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCommitment {
    pub commitment_digest: String,
    pub nonce: String,
    pub signature: String,
    pub timestamp: u64,
    pub subject_kind: SubjectKind,
}

impl From<&Commitment> for WireCommitment {
    fn from(c: &Commitment) -> Self {
        Self {
            commitment_digest: STANDARD.encode(c.digest),
            nonce: STANDARD.encode(c.nonce),
            signature: STANDARD.encode(c.signature),
            timestamp: c.timestamp,
            subject_kind: c.subject_kind,
        }
    }
}

impl WireCommitment {
    pub fn to_commitment(&self) -> Result<Commitment, CodecError> {
        Ok(Commitment {
            digest: decode_field("zkProof.commitmentDigest", &self.commitment_digest)?,
            nonce: decode_field("zkProof.nonce", &self.nonce)?,
            signature: decode_field("zkProof.signature", &self.signature)?,
            timestamp: self.timestamp,
            subject_kind: self.subject_kind,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub version: u8,
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub encrypted_message: String,
    #[serde(default)]
    pub nonce1: String,
    #[serde(default)]
    pub nonce2: String,
    #[serde(default)]
    pub ephemeral_public_key: String,
    pub from: String,
    pub to: String,
    pub timestamp: u64,
    pub sequence: u64,
    pub signature: String,
    #[serde(default)]
    pub zk_proof: Option<WireCommitment>,
    pub conversation_id: String,
}

impl WireEnvelope {
    pub fn new(
        env: &CiphertextEnvelope,
        proof: Option<&Commitment>,
        conversation_id: &str,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            message_id: env.message_id.clone(),
            kind: MESSAGE_TYPE_TEXT.to_string(),
            encrypted_message: STANDARD.encode(&env.encrypted_message),
            nonce1: STANDARD.encode(env.nonce1),
            nonce2: STANDARD.encode(env.nonce2),
            ephemeral_public_key: STANDARD.encode(env.ephemeral_public_key),
            from: STANDARD.encode(env.from),
            to: STANDARD.encode(env.to),
            timestamp: env.timestamp,
            sequence: env.sequence,
            signature: STANDARD.encode(env.signature),
            zk_proof: proof.map(WireCommitment::from),
            conversation_id: conversation_id.to_string(),
        }
    }

    /// Decode into the typed envelope, checking version, presence and lengths.
    pub fn to_ciphertext(&self) -> Result<CiphertextEnvelope, CodecError> {
        if self.version != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion(self.version));
        }
        if self.message_id.is_empty() {
            return Err(CodecError::Missing("messageId"));
        }
        if self.nonce1.is_empty() {
            return Err(CodecError::Missing("nonce1"));
        }
        if self.nonce2.is_empty() {
            return Err(CodecError::Missing("nonce2"));
        }
        if self.ephemeral_public_key.is_empty() {
            return Err(CodecError::Missing("ephemeralPublicKey"));
        }

        let encrypted_message = STANDARD
            .decode(&self.encrypted_message)
            .map_err(|e| CodecError::Malformed {
                field: "encryptedMessage",
                reason: e.to_string(),
            })?;

        Ok(CiphertextEnvelope {
            message_id: self.message_id.clone(),
            encrypted_message,
            nonce1: decode_field("nonce1", &self.nonce1)?,
            nonce2: decode_field("nonce2", &self.nonce2)?,
            ephemeral_public_key: decode_field("ephemeralPublicKey", &self.ephemeral_public_key)?,
            from: decode_field("from", &self.from)?,
            to: decode_field("to", &self.to)?,
            timestamp: self.timestamp,
            sequence: self.sequence,
            signature: decode_field("signature", &self.signature)?,
        })
    }

    pub fn proof(&self) -> Result<Option<Commitment>, CodecError> {
        self.zk_proof.as_ref().map(|p| p.to_commitment()).transpose()
    }

    pub fn to_json(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Malformed {
            field: "envelope",
            reason: e.to_string(),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CodecError> {
        serde_json::from_str(json).map_err(|e| CodecError::Malformed {
            field: "envelope",
            reason: e.to_string(),
        })
    }
}

fn decode_field<const N: usize>(field: &'static str, encoded: &str) -> Result<[u8; N], CodecError> {
    let raw = STANDARD.decode(encoded).map_err(|e| CodecError::Malformed {
        field,
        reason: e.to_string(),
    })?;
    let got = raw.len();
    raw.try_into().map_err(|_| CodecError::Malformed {
        field,
        reason: format!("expected {} bytes, got {}", N, got),
    })
}
