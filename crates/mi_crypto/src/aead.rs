//! Authenticated Encryption with Associated Data
//!
//! XChaCha20-Poly1305 (192-bit nonce). Key: 32 bytes. Nonce: 24 bytes.
//! Tag: 16 bytes.
//!
//! The wire formats place the tag BEFORE the ciphertext (`mac ∥ cipher`),
//! and some of them derive the nonce instead of carrying it, so the
//! primitives here are detached; `seal_prefixed`/`open_prefixed` provide the
//! common `nonce ∥ mac ∥ cipher` layout.

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt with an explicit nonce; returns `(tag, ciphertext)`.
pub fn seal_detached(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<([u8; TAG_LEN], Vec<u8>), CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadSeal)?;
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut buf)
        .map_err(|_| CryptoError::AeadSeal)?;
    Ok((tag.into(), buf))
}

/// Decrypt a detached `(tag, ciphertext)` pair. The plaintext comes back in a
/// zeroizing buffer; on tag mismatch nothing is exposed.
pub fn open_detached(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    tag: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadOpen)?;
    let mut buf = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut buf, tag.into())
        .map_err(|_| CryptoError::AeadOpen)?;
    Ok(buf)
}

/// Encrypt with a random nonce; wire layout `nonce(24) ∥ mac(16) ∥ cipher`.
pub fn seal_prefixed(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let nonce = generate_nonce();
    let (tag, ct) = seal_detached(key, &nonce, aad, plaintext)?;
    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Decrypt `nonce(24) ∥ mac(16) ∥ cipher`.
pub fn open_prefixed(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AeadOpen);
    }
    let nonce: [u8; NONCE_LEN] = data[..NONCE_LEN].try_into().expect("split len");
    let tag: [u8; TAG_LEN] = data[NONCE_LEN..NONCE_LEN + TAG_LEN]
        .try_into()
        .expect("split len");
    open_detached(key, &nonce, aad, &tag, &data[NONCE_LEN + TAG_LEN..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_roundtrip() {
        let key = [7u8; 32];
        let sealed = seal_prefixed(&key, b"ad", b"hello").unwrap();
        let plain = open_prefixed(&key, b"ad", &sealed).unwrap();
        assert_eq!(&plain[..], b"hello");
    }

    #[test]
    fn tamper_fails() {
        let key = [7u8; 32];
        let mut sealed = seal_prefixed(&key, b"ad", b"hello").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open_prefixed(&key, b"ad", &sealed).is_err());
    }

    #[test]
    fn wrong_aad_fails() {
        let key = [7u8; 32];
        let sealed = seal_prefixed(&key, b"ad", b"hello").unwrap();
        assert!(open_prefixed(&key, b"other", &sealed).is_err());
    }

    #[test]
    fn detached_roundtrip_with_derived_nonce() {
        let key = [1u8; 32];
        let nonce = [9u8; 24];
        let (tag, ct) = seal_detached(&key, &nonce, b"", b"chunk").unwrap();
        let plain = open_detached(&key, &nonce, b"", &tag, &ct).unwrap();
        assert_eq!(&plain[..], b"chunk");
    }
}
