//! Single-shot blobs (v1 plain, v2 deflated).
//!
//! Layout after the common prefix:
//!   `u64 original_size ∥ u64 stage1_size ∥ u64 stage2_size ∥ nonce(24) ∥
//!    mac(16) ∥ cipher(stage2_size)`
//!
//! v2 runs the plaintext through deflate twice before sealing; the header
//! records each intermediate size so the decoder can sanity-check every
//! stage. v1 keeps all three sizes equal.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use mi_crypto::aead;

use crate::error::BlobError;
use crate::header::{BlobHeader, ALGO_XCHACHA20_POLY1305, FLAG_DEFLATED, PREFIX_LEN};
use crate::MAX_PLAINTEXT;

const SIZES_LEN: usize = 24;
const AD_V1: &[u8] = b"mi_e2ee_blob_v1";

/// Extensions that are already entropy-dense; deflating them wastes time.
const COMPRESSED_EXTS: &[&str] = &[
    "zip", "gz", "zst", "xz", "bz2", "7z", "rar", "jpg", "jpeg", "png", "gif", "webp", "heic",
    "avif", "mp4", "mkv", "webm", "mp3", "ogg", "opus", "flac",
];

pub fn should_deflate(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, ext)) => !COMPRESSED_EXTS.contains(&ext.to_ascii_lowercase().as_str()),
        None => true,
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, BlobError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| BlobError::Deflate(e.to_string()))
}

fn inflate(data: &[u8], expected_len: u64) -> Result<Vec<u8>, BlobError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    // bound the read so a forged header cannot balloon memory
    let mut limited = (&mut decoder).take(expected_len + 1);
    limited
        .read_to_end(&mut out)
        .map_err(|e| BlobError::Deflate(e.to_string()))?;
    if out.len() as u64 != expected_len {
        return Err(BlobError::SizeMismatch);
    }
    Ok(out)
}

pub fn encrypt_single_shot(
    plain: &[u8],
    key: &[u8; 32],
    compress: bool,
) -> Result<Vec<u8>, BlobError> {
    let original_size = plain.len() as u64;

    let (version, flags, stage1, stage2) = if compress {
        let s1 = deflate(plain)?;
        let s2 = deflate(&s1)?;
        (2u8, FLAG_DEFLATED, s1.len() as u64, s2)
    } else {
        (1u8, 0u8, original_size, plain.to_vec())
    };
    let stage1_size = stage1;
    let stage2_size = stage2.len() as u64;

    let nonce = aead::generate_nonce();
    let (mac, cipher) = aead::seal_detached(key, &nonce, AD_V1, &stage2)?;

    let mut out = Vec::with_capacity(PREFIX_LEN + SIZES_LEN + 24 + 16 + cipher.len());
    BlobHeader {
        version,
        flags,
        algo: ALGO_XCHACHA20_POLY1305,
    }
    .write_prefix(&mut out);
    out.extend_from_slice(&original_size.to_le_bytes());
    out.extend_from_slice(&stage1_size.to_le_bytes());
    out.extend_from_slice(&stage2_size.to_le_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&cipher);
    Ok(out)
}

pub fn decrypt_single_shot(blob: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    let header = BlobHeader::parse_prefix(blob)?;
    if header.version != 1 && header.version != 2 {
        return Err(BlobError::BadVersion(header.version));
    }
    let fixed = PREFIX_LEN + SIZES_LEN + 24 + 16;
    if blob.len() < fixed {
        return Err(BlobError::Truncated);
    }
    let original_size = u64::from_le_bytes(blob[8..16].try_into().expect("len"));
    let stage1_size = u64::from_le_bytes(blob[16..24].try_into().expect("len"));
    let stage2_size = u64::from_le_bytes(blob[24..32].try_into().expect("len"));
    if original_size > MAX_PLAINTEXT || stage1_size > MAX_PLAINTEXT {
        return Err(BlobError::TooLarge(original_size.max(stage1_size)));
    }
    let nonce: [u8; 24] = blob[32..56].try_into().expect("len");
    let mac: [u8; 16] = blob[56..72].try_into().expect("len");
    let cipher = &blob[fixed..];
    if cipher.len() as u64 != stage2_size {
        return Err(BlobError::SizeMismatch);
    }

    let stage2 = aead::open_detached(key, &nonce, AD_V1, &mac, cipher)?;

    let deflated = header.flags & FLAG_DEFLATED != 0;
    if header.version == 1 || !deflated {
        if stage2.len() as u64 != original_size || stage1_size != original_size {
            return Err(BlobError::SizeMismatch);
        }
        return Ok(stage2.to_vec());
    }
    let stage1 = inflate(&stage2, stage1_size)?;
    inflate(&stage1, original_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip() {
        let key = [9u8; 32];
        let plain = b"small attachment".to_vec();
        let blob = encrypt_single_shot(&plain, &key, false).unwrap();
        assert_eq!(BlobHeader::parse_prefix(&blob).unwrap().version, 1);
        assert_eq!(decrypt_single_shot(&blob, &key).unwrap(), plain);
    }

    #[test]
    fn deflated_roundtrip_shrinks_redundant_input() {
        let key = [9u8; 32];
        let plain = vec![b'a'; 100_000];
        let blob = encrypt_single_shot(&plain, &key, true).unwrap();
        assert_eq!(BlobHeader::parse_prefix(&blob).unwrap().version, 2);
        assert!(blob.len() < plain.len() / 2);
        assert_eq!(decrypt_single_shot(&blob, &key).unwrap(), plain);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = [9u8; 32];
        let blob = encrypt_single_shot(b"payload", &key, false).unwrap();
        let mut bad = blob.clone();
        let last = bad.len() - 1;
        bad[last] ^= 1;
        assert!(matches!(
            decrypt_single_shot(&bad, &key),
            Err(BlobError::AuthFailed)
        ));
    }

    #[test]
    fn forged_size_fields_rejected() {
        let key = [9u8; 32];
        let mut blob = encrypt_single_shot(b"payload", &key, false).unwrap();
        // original_size is outside the MAC; forging it must still fail closed
        blob[8..16].copy_from_slice(&(9999u64).to_le_bytes());
        assert!(decrypt_single_shot(&blob, &key).is_err());
    }

    #[test]
    fn compressed_names_skip_deflate() {
        assert!(!should_deflate("photo.JPG"));
        assert!(!should_deflate("archive.tar.gz"));
        assert!(should_deflate("notes.txt"));
        assert!(should_deflate("README"));
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = [1u8; 32];
        let blob = encrypt_single_shot(b"", &key, false).unwrap();
        assert_eq!(decrypt_single_shot(&blob, &key).unwrap(), Vec::<u8>::new());
    }
}
