//! Constant-time comparison helpers.
//!
//! Digests, signatures and MACs must be compared without leaking how many
//! leading bytes matched.

use constant_time_eq::constant_time_eq;

/// Compare two byte slices in constant time.
///
/// Slices of different length compare unequal.
///
/// ```rust
/// use pcm_crypto::utils::constant_time_compare;
///
/// assert!(constant_time_compare(&[0u8; 32], &[0u8; 32]));
/// assert!(!constant_time_compare(&[0u8; 32], &[1u8; 32]));
/// ```
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    constant_time_eq(a, b)
}

/// Fixed-size variant of [`constant_time_compare`].
pub fn constant_time_compare_array<const N: usize>(a: &[u8; N], b: &[u8; N]) -> bool {
    constant_time_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_compare_equal() {
        assert!(constant_time_compare(b"commitment", b"commitment"));
    }

    #[test]
    fn test_constant_time_compare_different_length() {
        assert!(!constant_time_compare(b"digest", b"digest-extended"));
    }

    #[test]
    fn test_constant_time_compare_array_single_bit() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        b[31] = 1;
        assert!(!constant_time_compare_array(&a, &b));
        assert!(constant_time_compare_array(&a, &a));
    }
}
