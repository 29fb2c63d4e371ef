//! Content sealing for blobs handed to untrusted content-addressed storage.
//!
//! Each item gets its own key, derived from the local master key and a random
//! salt. The SHA-256 of the plaintext is carried alongside and bound into the
//! AEAD as associated data; opening re-checks it.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::boxes::{random_nonce, NONCE_LEN};
use crate::hash::sha256;
use crate::utils::constant_time_compare_array;

pub const CONTENT_SALT_LEN: usize = 16;

const CONTENT_KEY_INFO: &[u8] = b"pcm_content_v1_key";

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum ContentError {
    #[error("random source unavailable")]
    Rng,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("sealing failed")]
    SealFailed,
    #[error("content could not be opened")]
    OpenFailed,
    #[error("content integrity check failed")]
    IntegrityMismatch,
}

/// 256-bit master key for content sealing.
pub struct ContentKey(Zeroizing<[u8; 32]>);

impl ContentKey {
    pub fn generate() -> Result<Self, ContentError> {
        let mut key = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(&mut key[..]).map_err(|_| ContentError::Rng)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    fn item_cipher(
        &self,
        salt: &[u8; CONTENT_SALT_LEN],
    ) -> Result<XChaCha20Poly1305, ContentError> {
        let hk = Hkdf::<Sha256>::new(Some(&salt[..]), &self.0[..]);
        let mut key = Zeroizing::new([0u8; 32]);
        hk.expand(CONTENT_KEY_INFO, &mut key[..])
            .map_err(|_| ContentError::KeyDerivation)?;
        Ok(XChaCha20Poly1305::new(Key::from_slice(&key[..])))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedContent {
    pub ciphertext: Vec<u8>,
    pub salt: [u8; CONTENT_SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    /// SHA-256 of the plaintext.
    pub content_hash: [u8; 32],
}

pub fn seal_content(key: &ContentKey, content: &[u8]) -> Result<SealedContent, ContentError> {
    let mut salt = [0u8; CONTENT_SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|_| ContentError::Rng)?;
    let nonce = random_nonce().map_err(|_| ContentError::Rng)?;
    let content_hash = sha256(content);

    let ciphertext = key
        .item_cipher(&salt)?
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: content,
                aad: &content_hash,
            },
        )
        .map_err(|_| ContentError::SealFailed)?;

    Ok(SealedContent {
        ciphertext,
        salt,
        nonce,
        content_hash,
    })
}

pub fn open_content(key: &ContentKey, sealed: &SealedContent) -> Result<Vec<u8>, ContentError> {
    let content = key
        .item_cipher(&sealed.salt)?
        .decrypt(
            XNonce::from_slice(&sealed.nonce),
            Payload {
                msg: &sealed.ciphertext,
                aad: &sealed.content_hash,
            },
        )
        .map_err(|_| ContentError::OpenFailed)?;

    if !constant_time_compare_array(&sha256(&content), &sealed.content_hash) {
        return Err(ContentError::IntegrityMismatch);
    }
    Ok(content)
}
