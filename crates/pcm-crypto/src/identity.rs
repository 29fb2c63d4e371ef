//! Identity key pairs.
//!
//! A local identity is two independent key pairs: an X25519 [`KeyPair`] used
//! for authenticated boxes and an Ed25519 [`SigningKeyPair`] used only for
//! detached signatures. Secret halves are zeroized on drop and never appear
//! in `Debug` output.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::hash::{derive_anonymous_id, ANONYMOUS_ID_LEN};

/// Length of every public and secret key in this crate.
pub const KEY_LEN: usize = 32;
/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Error type for key handling.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid base64: {0}")]
    InvalidEncoding(String),
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// X25519 key pair for authenticated encryption.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: [u8; KEY_LEN],
}

impl KeyPair {
    /// Generate a key pair from the OS random source.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a key pair from its 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8; KEY_LEN]) -> Self {
        Self::from_secret(StaticSecret::from(*secret))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = X25519PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public
    }

    fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &encode_key(&self.public))
            .finish_non_exhaustive()
    }
}

/// Ed25519 key pair used only for detached signatures.
#[derive(Clone)]
pub struct SigningKeyPair {
    key: SigningKey,
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild from a 32-byte Ed25519 seed.
    pub fn from_secret_bytes(seed: &[u8; KEY_LEN]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.key.verifying_key().to_bytes()
    }

    fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.key.to_bytes())
    }

    /// Detached Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signature: Signature = self.key.sign(message);
        signature.to_bytes()
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &encode_key(&self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Base64 secret halves of an identity, for the owner's own storage.
///
/// This is the only way secret key bytes leave a key pair. The fields are
/// private and wiped on drop.
///
/// ```compile_fail
/// let pair = pcm_crypto::identity::KeyPair::generate();
/// let _ = pair.secret_bytes();
/// ```
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRecord {
    encryption_secret: String,
    signing_secret: String,
}

impl SecretKeyRecord {
    pub fn export(encryption: &KeyPair, signing: &SigningKeyPair) -> Self {
        Self {
            encryption_secret: encode_key(encryption.secret_bytes().as_ref()),
            signing_secret: encode_key(signing.secret_bytes().as_ref()),
        }
    }

    pub fn restore(&self) -> Result<(KeyPair, SigningKeyPair), KeyError> {
        let encryption = Zeroizing::new(decode_fixed::<KEY_LEN>(&self.encryption_secret)?);
        let signing = Zeroizing::new(decode_fixed::<KEY_LEN>(&self.signing_secret)?);
        Ok((
            KeyPair::from_secret_bytes(&encryption),
            SigningKeyPair::from_secret_bytes(&signing),
        ))
    }
}

/// Non-reversible device handle derived once from the encryption key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnonymousIdentity([u8; ANONYMOUS_ID_LEN]);

impl AnonymousIdentity {
    pub fn derive(encryption_public: &[u8; KEY_LEN], nonce: &[u8; 32], created_at_ms: u64) -> Self {
        Self(derive_anonymous_id(encryption_public, nonce, created_at_ms))
    }

    pub fn from_bytes(bytes: [u8; ANONYMOUS_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ANONYMOUS_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AnonymousIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AnonymousIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnonymousIdentity({})", self.to_hex())
    }
}

/// Verify a detached Ed25519 signature.
pub fn verify_signature(
    pub_key: &[u8; KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), KeyError> {
    let verifying_key = VerifyingKey::from_bytes(pub_key).map_err(|_| KeyError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);
    verifying_key
        .verify_strict(message, &sig)
        .map_err(|_| KeyError::InvalidSignature)
}

pub fn encode_key(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 into exactly `N` bytes.
pub fn decode_fixed<const N: usize>(encoded: &str) -> Result<[u8; N], KeyError> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;
    let got = raw.len();
    raw.try_into()
        .map_err(|_| KeyError::InvalidKeyLength { expected: N, got })
}

/// Decode an X25519 public key from base64.
pub fn decode_public_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    decode_fixed::<KEY_LEN>(encoded)
}

/// Decode an Ed25519 public key from base64, rejecting points off the curve.
pub fn decode_signing_public_key(encoded: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = decode_fixed::<KEY_LEN>(encoded)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_pair_restores_from_secret() {
        let original = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&original.secret_bytes());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_signing_key_pair_restores_from_secret() {
        let original = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_secret_bytes(&original.secret_bytes());
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_signature_round_trip() {
        let signer = SigningKeyPair::generate();
        let signature = signer.sign(b"hello");
        assert!(verify_signature(&signer.public_key(), b"hello", &signature).is_ok());
    }

    #[test]
    fn test_signature_wrong_message_fails() {
        let signer = SigningKeyPair::generate();
        let signature = signer.sign(b"original");
        assert_eq!(
            verify_signature(&signer.public_key(), b"tampered", &signature),
            Err(KeyError::InvalidSignature)
        );
    }

    #[test]
    fn test_signature_wrong_key_fails() {
        let signer = SigningKeyPair::generate();
        let other = SigningKeyPair::generate();
        let signature = signer.sign(b"message");
        assert!(verify_signature(&other.public_key(), b"message", &signature).is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let pair = KeyPair::generate();
        let secret_b64 = encode_key(pair.secret_bytes().as_ref());
        let rendered = format!("{:?}", pair);
        assert!(rendered.contains(&encode_key(&pair.public_key())));
        assert!(!rendered.contains(&secret_b64));
    }

    #[test]
    fn test_decode_public_key_lengths() {
        let pair = KeyPair::generate();
        let encoded = encode_key(&pair.public_key());
        assert_eq!(decode_public_key(&encoded).unwrap(), pair.public_key());

        assert_eq!(
            decode_public_key(&encode_key(&[1u8; 31])),
            Err(KeyError::InvalidKeyLength { expected: 32, got: 31 })
        );
        assert!(matches!(
            decode_public_key("not base64!"),
            Err(KeyError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_decode_signing_public_key() {
        let signer = SigningKeyPair::generate();
        let encoded = encode_key(&signer.public_key());
        assert_eq!(decode_signing_public_key(&encoded).unwrap(), signer.public_key());
    }

    #[test]
    fn test_secret_record_restores_both_pairs() {
        let encryption = KeyPair::generate();
        let signing = SigningKeyPair::generate();
        let json = serde_json::to_string(&SecretKeyRecord::export(&encryption, &signing)).unwrap();
        assert!(json.contains("encryptionSecret"));

        let record: SecretKeyRecord = serde_json::from_str(&json).unwrap();
        let (restored_enc, restored_sign) = record.restore().unwrap();
        assert_eq!(restored_enc.public_key(), encryption.public_key());
        assert_eq!(restored_sign.public_key(), signing.public_key());
    }

    #[test]
    fn test_secret_record_rejects_short_secret() {
        let record: SecretKeyRecord = serde_json::from_str(&format!(
            r#"{{"encryptionSecret":"{}","signingSecret":"{}"}}"#,
            encode_key(&[1u8; 31]),
            encode_key(&[2u8; 32])
        ))
        .unwrap();
        assert!(matches!(
            record.restore(),
            Err(KeyError::InvalidKeyLength { expected: 32, got: 31 })
        ));
    }

    #[test]
    fn test_anonymous_identity_hex() {
        let id = AnonymousIdentity::from_bytes([0xab; 16]);
        assert_eq!(id.to_hex(), "ab".repeat(16));
        assert_eq!(id.to_string().len(), 32);
    }
}
