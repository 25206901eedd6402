//! Shared sealed-payload layout for pairing and device-sync messages:
//!
//!   `magic(4) ∥ ver(1) ∥ nonce(24) ∥ mac(16) ∥ cipher`
//!
//! The 5-byte magic+version prefix doubles as the AEAD associated data, so a
//! payload of one kind can never be opened as another.

use mi_crypto::aead;
use zeroize::Zeroizing;

use crate::error::ProtoError;

const VER: u8 = 1;
const PREFIX_LEN: usize = 5;
const MIN_LEN: usize = PREFIX_LEN + aead::NONCE_LEN + aead::TAG_LEN + 1;

pub(crate) fn seal(
    magic: &[u8; 4],
    key: &[u8; 32],
    plaintext: &[u8],
) -> Result<Vec<u8>, ProtoError> {
    if plaintext.is_empty() {
        return Err(ProtoError::Truncated);
    }
    let mut ad = [0u8; PREFIX_LEN];
    ad[..4].copy_from_slice(magic);
    ad[4] = VER;

    let nonce = aead::generate_nonce();
    let (tag, ct) = aead::seal_detached(key, &nonce, &ad, plaintext)?;

    let mut out = Vec::with_capacity(PREFIX_LEN + aead::NONCE_LEN + aead::TAG_LEN + ct.len());
    out.extend_from_slice(&ad);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ct);
    Ok(out)
}

pub(crate) fn open(
    magic: &[u8; 4],
    key: &[u8; 32],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, ProtoError> {
    if data.len() < MIN_LEN {
        return Err(ProtoError::Truncated);
    }
    if &data[..4] != magic {
        return Err(ProtoError::BadMagic);
    }
    if data[4] != VER {
        return Err(ProtoError::BadVersion(data[4]));
    }
    let ad = &data[..PREFIX_LEN];
    let nonce: [u8; aead::NONCE_LEN] = data[PREFIX_LEN..PREFIX_LEN + aead::NONCE_LEN]
        .try_into()
        .expect("len");
    let tag_start = PREFIX_LEN + aead::NONCE_LEN;
    let tag: [u8; aead::TAG_LEN] = data[tag_start..tag_start + aead::TAG_LEN]
        .try_into()
        .expect("len");
    let cipher = &data[tag_start + aead::TAG_LEN..];
    aead::open_detached(key, &nonce, ad, &tag, cipher).map_err(|_| ProtoError::AuthFailed)
}
