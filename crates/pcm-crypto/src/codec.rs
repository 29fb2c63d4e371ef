//! Double-layer message codec.
//!
//! Layer 1 is a box from the sender's long-term key to the recipient. Layer 2
//! re-boxes the layer 1 ciphertext under a per-message ephemeral key, which is
//! dropped as soon as the message is sealed. The outer ciphertext, message id
//! and timestamp are covered by a detached Ed25519 signature.
//!
//! Signature verification is advisory on the receiving side: an unknown or
//! failing signature downgrades `verified` but never blocks decryption.

use bytes::Bytes;

use crate::boxes::{self, random_nonce, BoxError, NONCE_LEN};
use crate::identity::{verify_signature, KeyPair, SigningKeyPair, KEY_LEN, SIGNATURE_LEN};

/// Which layer of the envelope failed to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Inner layer, keyed by the sender's long-term key.
    Layer1,
    /// Outer layer, keyed by the per-message ephemeral key.
    Layer2,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Layer1 => f.write_str("layer1"),
            Layer::Layer2 => f.write_str("layer2"),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encryption failed: {0}")]
    EncryptFailed(BoxError),
    #[error("decryption failed at {0}")]
    DecryptFailed(Layer),
    #[error("missing field: {0}")]
    Missing(&'static str),
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
}

/// Per-message metadata bound into the signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_id: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub sequence: u64,
}

/// Encrypted, signed message. Never carries plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextEnvelope {
    pub message_id: String,
    pub encrypted_message: Vec<u8>,
    pub nonce1: [u8; NONCE_LEN],
    pub nonce2: [u8; NONCE_LEN],
    pub ephemeral_public_key: [u8; KEY_LEN],
    /// Sender's X25519 public key.
    pub from: [u8; KEY_LEN],
    /// Recipient's X25519 public key.
    pub to: [u8; KEY_LEN],
    pub timestamp: u64,
    pub sequence: u64,
    pub signature: [u8; SIGNATURE_LEN],
}

/// Result of opening an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub plaintext: Bytes,
    /// True only when a known signing key validated the signature.
    pub verified: bool,
}

/// `ciphertext || message_id || timestamp_be`
pub fn signed_payload(ciphertext: &[u8], message_id: &str, timestamp: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ciphertext.len() + message_id.len() + 8);
    payload.extend_from_slice(ciphertext);
    payload.extend_from_slice(message_id.as_bytes());
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload
}

/// Encrypt `plaintext` for `recipient_public` and sign the outer layer.
pub fn encrypt_message(
    plaintext: &[u8],
    header: &MessageHeader,
    sender: &KeyPair,
    sender_signing: &SigningKeyPair,
    recipient_public: &[u8; KEY_LEN],
) -> Result<CiphertextEnvelope, CodecError> {
    let nonce1 = random_nonce().map_err(CodecError::EncryptFailed)?;
    let nonce2 = random_nonce().map_err(CodecError::EncryptFailed)?;

    let layer1 = boxes::seal(plaintext, &nonce1, recipient_public, sender.secret())
        .map_err(CodecError::EncryptFailed)?;
    let (ephemeral_public_key, layer2) = boxes::seal_ephemeral(&layer1, &nonce2, recipient_public)
        .map_err(CodecError::EncryptFailed)?;

    let signature = sender_signing.sign(&signed_payload(
        &layer2,
        &header.message_id,
        header.timestamp,
    ));

    Ok(CiphertextEnvelope {
        message_id: header.message_id.clone(),
        encrypted_message: layer2,
        nonce1,
        nonce2,
        ephemeral_public_key,
        from: sender.public_key(),
        to: *recipient_public,
        timestamp: header.timestamp,
        sequence: header.sequence,
        signature,
    })
}

/// Check the envelope signature against `sender_signing_public`.
pub fn verify_envelope(env: &CiphertextEnvelope, sender_signing_public: &[u8; KEY_LEN]) -> bool {
    let payload = signed_payload(&env.encrypted_message, &env.message_id, env.timestamp);
    verify_signature(sender_signing_public, &payload, &env.signature).is_ok()
}

/// Verify (advisory), then open both layers with the recipient's key pair.
pub fn decrypt_message(
    env: &CiphertextEnvelope,
    recipient: &KeyPair,
    sender_signing_public: Option<&[u8; KEY_LEN]>,
) -> Result<Decrypted, CodecError> {
    let verified = sender_signing_public
        .map(|key| verify_envelope(env, key))
        .unwrap_or(false);

    let layer1 = boxes::open(
        &env.encrypted_message,
        &env.nonce2,
        &env.ephemeral_public_key,
        recipient.secret(),
    )
    .map_err(|_| CodecError::DecryptFailed(Layer::Layer2))?;

    let plaintext = boxes::open(&layer1, &env.nonce1, &env.from, recipient.secret())
        .map_err(|_| CodecError::DecryptFailed(Layer::Layer1))?;

    Ok(Decrypted {
        plaintext: Bytes::from(plaintext),
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct Party {
        enc: KeyPair,
        sign: SigningKeyPair,
    }

    fn party() -> Party {
        Party {
            enc: KeyPair::generate(),
            sign: SigningKeyPair::generate(),
        }
    }

    fn header(id: &str) -> MessageHeader {
        MessageHeader {
            message_id: id.to_string(),
            timestamp: 1_700_000_000_000,
            sequence: 1,
        }
    }

    fn seal(alice: &Party, bob: &Party, text: &[u8]) -> CiphertextEnvelope {
        encrypt_message(text, &header("m-1"), &alice.enc, &alice.sign, &bob.enc.public_key())
            .unwrap()
    }

    #[test]
    fn test_round_trip_verified() {
        let alice = party();
        let bob = party();
        let env = seal(&alice, &bob, b"hello");

        let out = decrypt_message(&env, &bob.enc, Some(&alice.sign.public_key())).unwrap();
        assert_eq!(out.plaintext.as_ref(), b"hello");
        assert!(out.verified);
        assert_eq!(env.from, alice.enc.public_key());
        assert_eq!(env.to, bob.enc.public_key());
    }

    #[test]
    fn test_round_trip_empty_and_large() {
        let alice = party();
        let bob = party();
        let big = vec![0x5au8; 1024 * 1024 + 3];

        for text in [Vec::new(), big] {
            let env = seal(&alice, &bob, &text);
            let out = decrypt_message(&env, &bob.enc, Some(&alice.sign.public_key())).unwrap();
            assert_eq!(out.plaintext.as_ref(), text.as_slice());
            assert!(out.verified);
        }
    }

    #[test]
    fn test_unknown_signing_key_is_unverified_but_decrypts() {
        let alice = party();
        let bob = party();
        let env = seal(&alice, &bob, b"hi");

        let out = decrypt_message(&env, &bob.enc, None).unwrap();
        assert_eq!(out.plaintext.as_ref(), b"hi");
        assert!(!out.verified);
    }

    #[test]
    fn test_fresh_material_per_message() {
        let alice = party();
        let bob = party();
        let mut ephemerals = HashSet::new();
        let mut nonces = HashSet::new();
        let mut ciphertexts = HashSet::new();

        for _ in 0..100 {
            let env = seal(&alice, &bob, b"same plaintext");
            assert!(ephemerals.insert(env.ephemeral_public_key));
            assert!(nonces.insert(env.nonce1));
            assert!(nonces.insert(env.nonce2));
            assert!(ciphertexts.insert(env.encrypted_message));
        }
    }

    #[test]
    fn test_flipped_ciphertext_is_rejected() {
        let alice = party();
        let bob = party();
        let env = seal(&alice, &bob, b"integrity");

        for i in 0..env.encrypted_message.len() {
            let mut tampered = env.clone();
            tampered.encrypted_message[i] ^= 0x01;
            match decrypt_message(&tampered, &bob.enc, Some(&alice.sign.public_key())) {
                Err(CodecError::DecryptFailed(_)) => {}
                Ok(out) => assert!(!out.verified, "byte {} accepted as verified", i),
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
    }

    #[test]
    fn test_flipped_signature_only_downgrades_trust() {
        let alice = party();
        let bob = party();
        let mut env = seal(&alice, &bob, b"still readable");
        env.signature[0] ^= 0xff;

        let out = decrypt_message(&env, &bob.enc, Some(&alice.sign.public_key())).unwrap();
        assert_eq!(out.plaintext.as_ref(), b"still readable");
        assert!(!out.verified);
    }

    #[test]
    fn test_signature_binds_message_id_and_timestamp() {
        let alice = party();
        let bob = party();
        let env = seal(&alice, &bob, b"bound");

        let mut renamed = env.clone();
        renamed.message_id = "m-2".into();
        assert!(!verify_envelope(&renamed, &alice.sign.public_key()));

        let mut shifted = env;
        shifted.timestamp += 1;
        assert!(!verify_envelope(&shifted, &alice.sign.public_key()));
    }

    #[test]
    fn test_wrong_recipient_fails_outer_layer() {
        let alice = party();
        let bob = party();
        let eve = party();
        let env = seal(&alice, &bob, b"not for eve");

        assert_eq!(
            decrypt_message(&env, &eve.enc, None),
            Err(CodecError::DecryptFailed(Layer::Layer2))
        );
    }

    #[test]
    fn test_forged_sender_fails_inner_layer() {
        let alice = party();
        let bob = party();
        let mallory = party();
        let mut env = seal(&alice, &bob, b"who sent this");
        env.from = mallory.enc.public_key();

        assert_eq!(
            decrypt_message(&env, &bob.enc, None),
            Err(CodecError::DecryptFailed(Layer::Layer1))
        );
    }

    #[test]
    fn test_ephemeral_secret_is_required() {
        // Long-term keys of both parties are not enough to reopen layer 2.
        let alice = party();
        let bob = party();
        let env = seal(&alice, &bob, b"forward secret");

        let attempt = boxes::open(
            &env.encrypted_message,
            &env.nonce2,
            &bob.enc.public_key(),
            alice.enc.secret(),
        );
        assert!(attempt.is_err());
    }
}
