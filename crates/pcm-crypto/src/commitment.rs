//! Hiding, binding commitments used as anonymous proofs of action.
//!
//! `digest = sha256(subject || nonce)` hides the subject behind a random
//! 32-byte nonce; anyone holding `(digest, nonce)` can check a claimed
//! subject. The digest is signed so the proof is attributable to a signing
//! key without revealing what was committed to.

use serde::{Deserialize, Serialize};

use crate::hash::sha256_parts;
use crate::identity::{verify_signature, AnonymousIdentity, SigningKeyPair, KEY_LEN, SIGNATURE_LEN};
use crate::utils::constant_time_compare_array;

pub const COMMITMENT_NONCE_LEN: usize = 32;

/// What kind of action a commitment attests to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    Identity,
    Message,
    Query,
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum CommitmentError {
    #[error("random source unavailable")]
    Rng,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment {
    pub digest: [u8; 32],
    pub nonce: [u8; COMMITMENT_NONCE_LEN],
    pub signature: [u8; SIGNATURE_LEN],
    /// Unix milliseconds.
    pub timestamp: u64,
    pub subject_kind: SubjectKind,
}

pub fn commitment_digest(subject: &[u8], nonce: &[u8; COMMITMENT_NONCE_LEN]) -> [u8; 32] {
    sha256_parts(&[subject, &nonce[..]])
}

/// Commit to `subject` and sign the digest.
pub fn commit(
    subject: &[u8],
    subject_kind: SubjectKind,
    signing: &SigningKeyPair,
    timestamp: u64,
) -> Result<Commitment, CommitmentError> {
    let mut nonce = [0u8; COMMITMENT_NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| CommitmentError::Rng)?;

    let digest = commitment_digest(subject, &nonce);
    let signature = signing.sign(&digest);

    Ok(Commitment {
        digest,
        nonce,
        signature,
        timestamp,
        subject_kind,
    })
}

/// True iff `claimed_subject` opens the commitment AND the digest signature
/// verifies under `signing_public`.
pub fn verify(
    commitment: &Commitment,
    claimed_subject: &[u8],
    signing_public: &[u8; KEY_LEN],
) -> bool {
    let recomputed = commitment_digest(claimed_subject, &commitment.nonce);
    let opens = constant_time_compare_array(&recomputed, &commitment.digest);
    let signed =
        verify_signature(signing_public, &commitment.digest, &commitment.signature).is_ok();
    opens && signed
}

/// Subject bytes for a send proof: `message_id || conversation_id`.
pub fn message_subject(message_id: &str, conversation_id: &str) -> Vec<u8> {
    let mut subject = Vec::with_capacity(message_id.len() + conversation_id.len());
    subject.extend_from_slice(message_id.as_bytes());
    subject.extend_from_slice(conversation_id.as_bytes());
    subject
}

/// Proof that a search query was issued, without revealing it.
pub fn commit_query(
    query: &str,
    signing: &SigningKeyPair,
    timestamp: u64,
) -> Result<Commitment, CommitmentError> {
    commit(query.as_bytes(), SubjectKind::Query, signing, timestamp)
}

/// Proof of holding the identity behind an anonymous handle.
pub fn commit_identity(
    identity: &AnonymousIdentity,
    signing: &SigningKeyPair,
    timestamp: u64,
) -> Result<Commitment, CommitmentError> {
    commit(identity.as_bytes(), SubjectKind::Identity, signing, timestamp)
}
