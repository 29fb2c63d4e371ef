use sha2::{Digest, Sha256};

/// Length of an anonymous identity handle in bytes.
pub const ANONYMOUS_ID_LEN: usize = 16;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    sha256_parts(&[data])
}

/// SHA-256 over the plain concatenation of `parts`.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}

/// Anonymous identity derivation:
/// id = sha256(enc_pub || nonce || created_at_ms_be)[..16].
pub fn derive_anonymous_id(
    encryption_public: &[u8; 32],
    nonce: &[u8; 32],
    created_at_ms: u64,
) -> [u8; ANONYMOUS_ID_LEN] {
    let full = sha256_parts(&[
        &encryption_public[..],
        &nonce[..],
        &created_at_ms.to_be_bytes()[..],
    ]);
    let mut id = [0u8; ANONYMOUS_ID_LEN];
    id.copy_from_slice(&full[..ANONYMOUS_ID_LEN]);
    id
}
