//! Constant-time comparison.
//!
//! Fingerprints, proofs, SAS strings, and handshake transcripts are compared
//! through here; a timing oracle on any of them weakens the trust checks.

use subtle::ConstantTimeEq;

/// Compare two byte slices in constant time.
/// Slices of different lengths compare unequal (length is not secret).
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_and_unequal() {
        assert!(ct_eq(b"abcd", b"abcd"));
        assert!(!ct_eq(b"abcd", b"abce"));
        assert!(!ct_eq(b"abcd", b"abc"));
        assert!(ct_eq(b"", b""));
    }
}
