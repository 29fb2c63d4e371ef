//! Authenticated box primitive.
//!
//! `box(msg, nonce, their_pub, my_secret)` seals with XChaCha20-Poly1305 under
//! a key derived by HKDF-SHA256 from the X25519 shared secret. The shared
//! secret is symmetric, so the peer opens with its own secret and our public
//! key. Non-contributory (low-order) public keys are rejected.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use crate::identity::KEY_LEN;

/// Nonce length required by the box primitive.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag overhead added to every sealed message.
pub const TAG_LEN: usize = 16;

const BOX_KEY_INFO: &[u8] = b"pcm_box_v1_key";

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum BoxError {
    #[error("random source unavailable")]
    Rng,
    #[error("peer public key is not contributory")]
    WeakPublicKey,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("sealing failed")]
    SealFailed,
    #[error("authentication failed")]
    OpenFailed,
}

/// Draw a fresh random nonce.
pub fn random_nonce() -> Result<[u8; NONCE_LEN], BoxError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| BoxError::Rng)?;
    Ok(nonce)
}

fn box_key(shared: &SharedSecret) -> Result<Zeroizing<[u8; 32]>, BoxError> {
    if !shared.was_contributory() {
        return Err(BoxError::WeakPublicKey);
    }
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(BOX_KEY_INFO, &mut key[..])
        .map_err(|_| BoxError::KeyDerivation)?;
    Ok(key)
}

fn seal_with(
    shared: &SharedSecret,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, BoxError> {
    let key = box_key(shared)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| BoxError::SealFailed)
}

/// Seal `plaintext` from `my_secret` to `their_public`.
pub fn seal(
    plaintext: &[u8],
    nonce: &[u8; NONCE_LEN],
    their_public: &[u8; KEY_LEN],
    my_secret: &StaticSecret,
) -> Result<Vec<u8>, BoxError> {
    let shared = my_secret.diffie_hellman(&X25519PublicKey::from(*their_public));
    seal_with(&shared, nonce, plaintext)
}

/// Seal under a fresh ephemeral key that is consumed by this call.
///
/// Returns the ephemeral public key and the ciphertext.
pub fn seal_ephemeral(
    plaintext: &[u8],
    nonce: &[u8; NONCE_LEN],
    their_public: &[u8; KEY_LEN],
) -> Result<([u8; KEY_LEN], Vec<u8>), BoxError> {
    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519PublicKey::from(&eph).to_bytes();
    let shared = eph.diffie_hellman(&X25519PublicKey::from(*their_public));
    let ciphertext = seal_with(&shared, nonce, plaintext)?;
    Ok((eph_pub, ciphertext))
}

/// Open a box sealed by `their_public` to `my_secret`.
pub fn open(
    ciphertext: &[u8],
    nonce: &[u8; NONCE_LEN],
    their_public: &[u8; KEY_LEN],
    my_secret: &StaticSecret,
) -> Result<Vec<u8>, BoxError> {
    let shared = my_secret.diffie_hellman(&X25519PublicKey::from(*their_public));
    let key = box_key(&shared)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| BoxError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_box_round_trip() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let nonce = random_nonce().unwrap();

        let ct = seal(b"hi bob", &nonce, &bob.public_key(), alice.secret()).unwrap();
        assert_eq!(ct.len(), b"hi bob".len() + TAG_LEN);

        let pt = open(&ct, &nonce, &alice.public_key(), bob.secret()).unwrap();
        assert_eq!(pt, b"hi bob");
    }

    #[test]
    fn test_ephemeral_round_trip() {
        let bob = KeyPair::generate();
        let nonce = random_nonce().unwrap();

        let (eph_pub, ct) = seal_ephemeral(b"fresh", &nonce, &bob.public_key()).unwrap();
        let pt = open(&ct, &nonce, &eph_pub, bob.secret()).unwrap();
        assert_eq!(pt, b"fresh");
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let nonce = random_nonce().unwrap();
        let ct = seal(b"x", &nonce, &bob.public_key(), alice.secret()).unwrap();

        let other = random_nonce().unwrap();
        assert_eq!(
            open(&ct, &other, &alice.public_key(), bob.secret()),
            Err(BoxError::OpenFailed)
        );
    }

    #[test]
    fn test_third_party_cannot_open() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let eve = KeyPair::generate();
        let nonce = random_nonce().unwrap();
        let ct = seal(b"secret", &nonce, &bob.public_key(), alice.secret()).unwrap();

        assert!(open(&ct, &nonce, &alice.public_key(), eve.secret()).is_err());
    }

    #[test]
    fn test_low_order_key_rejected() {
        let alice = KeyPair::generate();
        let nonce = random_nonce().unwrap();
        assert_eq!(
            seal(b"x", &nonce, &[0u8; 32], alice.secret()),
            Err(BoxError::WeakPublicKey)
        );
    }
}
