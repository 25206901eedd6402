//! Chunked blobs (v3 raw, v4 length-padded).
//!
//! All chunks are sealed under the same key with a per-chunk nonce:
//! `nonce[0..16] = base[0..16]; nonce[16..24] = chunk_index LE`. The AD
//! binds the version tag and the index, so chunks cannot be reordered.
//!
//! v3 tail: `u32 chunk_size ∥ u64 original_size ∥ base_nonce(24)` then
//! `ceil(original/chunk_size)` records of `mac(16) ∥ cipher(plain_len)`.
//!
//! v4 tail: `u32 chunk_count ∥ u64 original_size ∥ base_nonce(24) ∥
//! u32 chunk_sizes[count]` then per-chunk `mac(16) ∥ cipher(padded_len)`;
//! the first 4 bytes of each decrypted chunk hold the true plaintext length
//! and the rest of the bucket is random fill.

use rand::RngCore;

use mi_crypto::aead;

use crate::error::BlobError;
use crate::header::{BlobHeader, ALGO_XCHACHA20_POLY1305, PREFIX_LEN};
use crate::{CHUNK_SIZE, MAX_PLAINTEXT};

const AD_V3: &[u8] = b"mi_e2ee_blob_v3";
const AD_V4: &[u8] = b"mi_e2ee_blob_v4";

/// v4 per-chunk padded sizes, in bytes.
pub const CHUNK_BUCKETS: &[usize] = &[
    64 * 1024,
    96 * 1024,
    128 * 1024,
    160 * 1024,
    192 * 1024,
    256 * 1024,
    384 * 1024,
];

const CHUNK_LEN_PREFIX: usize = 4;

fn chunk_nonce(base: &[u8; 24], idx: u64) -> [u8; 24] {
    let mut nonce = *base;
    nonce[16..24].copy_from_slice(&idx.to_le_bytes());
    nonce
}

fn chunk_ad(tag: &[u8], idx: u64) -> Vec<u8> {
    let mut ad = tag.to_vec();
    ad.extend_from_slice(&idx.to_le_bytes());
    ad
}

fn bucket_for(padded_need: usize) -> Result<usize, BlobError> {
    CHUNK_BUCKETS
        .iter()
        .copied()
        .find(|&b| b >= padded_need)
        .ok_or(BlobError::SizeMismatch)
}

// ── v3 ───────────────────────────────────────────────────────────────────────

pub fn encrypt_v3(plain: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    if plain.len() as u64 > MAX_PLAINTEXT {
        return Err(BlobError::TooLarge(plain.len() as u64));
    }
    let base = aead::generate_nonce();
    let mut out = Vec::with_capacity(PREFIX_LEN + 36 + plain.len() + plain.len() / CHUNK_SIZE * 16);
    BlobHeader {
        version: 3,
        flags: 0,
        algo: ALGO_XCHACHA20_POLY1305,
    }
    .write_prefix(&mut out);
    out.extend_from_slice(&(CHUNK_SIZE as u32).to_le_bytes());
    out.extend_from_slice(&(plain.len() as u64).to_le_bytes());
    out.extend_from_slice(&base);

    for (idx, chunk) in plain.chunks(CHUNK_SIZE).enumerate() {
        let nonce = chunk_nonce(&base, idx as u64);
        let (mac, cipher) = aead::seal_detached(key, &nonce, &chunk_ad(AD_V3, idx as u64), chunk)?;
        out.extend_from_slice(&mac);
        out.extend_from_slice(&cipher);
    }
    Ok(out)
}

pub fn decrypt_v3(blob: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    let header = BlobHeader::parse_prefix(blob)?;
    if header.version != 3 {
        return Err(BlobError::BadVersion(header.version));
    }
    let fixed = PREFIX_LEN + 4 + 8 + 24;
    if blob.len() < fixed {
        return Err(BlobError::Truncated);
    }
    let chunk_size = u32::from_le_bytes(blob[8..12].try_into().expect("len")) as usize;
    let original_size = u64::from_le_bytes(blob[12..20].try_into().expect("len"));
    if chunk_size == 0 || original_size > MAX_PLAINTEXT {
        return Err(BlobError::BadHeader);
    }
    let base: [u8; 24] = blob[20..44].try_into().expect("len");

    let chunk_count = (original_size as usize).div_ceil(chunk_size);
    let mut out = Vec::with_capacity(original_size as usize);
    let mut off = fixed;
    for idx in 0..chunk_count {
        let remaining_plain = original_size as usize - out.len();
        let plain_len = remaining_plain.min(chunk_size);
        if blob.len() < off + 16 + plain_len {
            return Err(BlobError::Truncated);
        }
        let mac: [u8; 16] = blob[off..off + 16].try_into().expect("len");
        let cipher = &blob[off + 16..off + 16 + plain_len];
        off += 16 + plain_len;
        let nonce = chunk_nonce(&base, idx as u64);
        let plain = aead::open_detached(key, &nonce, &chunk_ad(AD_V3, idx as u64), &mac, cipher)?;
        out.extend_from_slice(&plain);
    }
    if off != blob.len() || out.len() as u64 != original_size {
        return Err(BlobError::SizeMismatch);
    }
    Ok(out)
}

// ── v4 ───────────────────────────────────────────────────────────────────────

pub fn encrypt_v4(plain: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    if plain.len() as u64 > MAX_PLAINTEXT {
        return Err(BlobError::TooLarge(plain.len() as u64));
    }
    let base = aead::generate_nonce();
    let chunks: Vec<&[u8]> = if plain.is_empty() {
        vec![&[]]
    } else {
        plain.chunks(CHUNK_SIZE).collect()
    };

    let mut padded_sizes = Vec::with_capacity(chunks.len());
    for chunk in &chunks {
        padded_sizes.push(bucket_for(CHUNK_LEN_PREFIX + chunk.len())? as u32);
    }

    let mut out = Vec::with_capacity(PREFIX_LEN + 36 + 4 * chunks.len());
    BlobHeader {
        version: 4,
        flags: 0,
        algo: ALGO_XCHACHA20_POLY1305,
    }
    .write_prefix(&mut out);
    out.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    out.extend_from_slice(&(plain.len() as u64).to_le_bytes());
    out.extend_from_slice(&base);
    for size in &padded_sizes {
        out.extend_from_slice(&size.to_le_bytes());
    }

    for (idx, chunk) in chunks.iter().enumerate() {
        let target = padded_sizes[idx] as usize;
        let mut padded = Vec::with_capacity(target);
        padded.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        padded.extend_from_slice(chunk);
        let fill = target - padded.len();
        if fill > 0 {
            let mut tail = vec![0u8; fill];
            rand::rngs::OsRng.fill_bytes(&mut tail);
            padded.extend_from_slice(&tail);
        }
        let nonce = chunk_nonce(&base, idx as u64);
        let (mac, cipher) =
            aead::seal_detached(key, &nonce, &chunk_ad(AD_V4, idx as u64), &padded)?;
        out.extend_from_slice(&mac);
        out.extend_from_slice(&cipher);
    }
    Ok(out)
}

pub fn decrypt_v4(blob: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    let header = BlobHeader::parse_prefix(blob)?;
    if header.version != 4 {
        return Err(BlobError::BadVersion(header.version));
    }
    let fixed = PREFIX_LEN + 4 + 8 + 24;
    if blob.len() < fixed {
        return Err(BlobError::Truncated);
    }
    let chunk_count = u32::from_le_bytes(blob[8..12].try_into().expect("len")) as usize;
    let original_size = u64::from_le_bytes(blob[12..20].try_into().expect("len"));
    if original_size > MAX_PLAINTEXT {
        return Err(BlobError::TooLarge(original_size));
    }
    let max_chunks = (MAX_PLAINTEXT as usize).div_ceil(CHUNK_SIZE) + 1;
    if chunk_count == 0 || chunk_count > max_chunks {
        return Err(BlobError::BadHeader);
    }
    let base: [u8; 24] = blob[20..44].try_into().expect("len");

    let table_end = fixed + 4 * chunk_count;
    if blob.len() < table_end {
        return Err(BlobError::Truncated);
    }
    let mut padded_sizes = Vec::with_capacity(chunk_count);
    for i in 0..chunk_count {
        let off = fixed + 4 * i;
        let size = u32::from_le_bytes(blob[off..off + 4].try_into().expect("len")) as usize;
        if !CHUNK_BUCKETS.contains(&size) {
            return Err(BlobError::BadHeader);
        }
        padded_sizes.push(size);
    }

    let mut out = Vec::with_capacity(original_size as usize);
    let mut off = table_end;
    for (idx, &padded_len) in padded_sizes.iter().enumerate() {
        if blob.len() < off + 16 + padded_len {
            return Err(BlobError::Truncated);
        }
        let mac: [u8; 16] = blob[off..off + 16].try_into().expect("len");
        let cipher = &blob[off + 16..off + 16 + padded_len];
        off += 16 + padded_len;
        let nonce = chunk_nonce(&base, idx as u64);
        let padded = aead::open_detached(key, &nonce, &chunk_ad(AD_V4, idx as u64), &mac, cipher)?;
        let true_len =
            u32::from_le_bytes(padded[..CHUNK_LEN_PREFIX].try_into().expect("len")) as usize;
        if CHUNK_LEN_PREFIX + true_len > padded.len() || true_len > CHUNK_SIZE {
            return Err(BlobError::SizeMismatch);
        }
        out.extend_from_slice(&padded[CHUNK_LEN_PREFIX..CHUNK_LEN_PREFIX + true_len]);
    }
    if off != blob.len() || out.len() as u64 != original_size {
        return Err(BlobError::SizeMismatch);
    }
    Ok(out)
}
