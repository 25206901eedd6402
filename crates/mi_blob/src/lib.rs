//! mi_blob — encrypted file-blob codec
//!
//! File payloads ride the relay as opaque authenticated blobs (`MIF1`).
//! Two regimes, chosen by plaintext size:
//!
//! - ≤ 8 MiB: single-shot AEAD (v1), optionally through a two-stage deflate
//!   pipeline (v2) when the name does not look already compressed.
//! - > 8 MiB: chunked (v3 raw, v4 length-padded buckets), per-chunk nonces
//!   derived from a base nonce and the chunk index, resumable over the dumb
//!   relay store.
//!
//! The relay is never trusted with integrity; every chunk MAC is checked on
//! the way back.

pub mod chunked;
pub mod error;
pub mod header;
pub mod seal;
pub mod session;

pub use error::BlobError;
pub use header::{BlobHeader, BLOB_MAGIC};

/// Plaintext above this goes through the chunked (v3/v4) path.
pub const SINGLE_SHOT_MAX: u64 = 8 * 1024 * 1024;

/// Hard caps from the protocol.
pub const MAX_PLAINTEXT: u64 = 300 * 1024 * 1024;
pub const MAX_WIRE: u64 = 320 * 1024 * 1024;

/// Plaintext chunk granularity for v3/v4 blobs.
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Network transfer unit for resumable upload/download requests. Distinct
/// from the blob chunk granularity on purpose; the relay streams 4 MiB
/// slices of the opaque blob while the cipher works in 128 KiB chunks.
pub const TRANSFER_UNIT: usize = 4 * 1024 * 1024;

/// On-disk store granularity the relay advertises for ranged reads.
pub const STORE_CHUNK: usize = 256 * 1024;

/// Encrypt choosing the regime by size; `name` drives the deflate decision.
pub fn encrypt_auto(plain: &[u8], key: &[u8; 32], name: &str) -> Result<Vec<u8>, BlobError> {
    if plain.len() as u64 > MAX_PLAINTEXT {
        return Err(BlobError::TooLarge(plain.len() as u64));
    }
    if plain.len() as u64 <= SINGLE_SHOT_MAX {
        seal::encrypt_single_shot(plain, key, seal::should_deflate(name))
    } else {
        chunked::encrypt_v4(plain, key)
    }
}

/// Decrypt any supported version, dispatching on the header version byte.
pub fn decrypt_auto(blob: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, BlobError> {
    if blob.len() as u64 > MAX_WIRE {
        return Err(BlobError::TooLarge(blob.len() as u64));
    }
    let header = BlobHeader::parse_prefix(blob)?;
    match header.version {
        1 | 2 => seal::decrypt_single_shot(blob, key),
        3 => chunked::decrypt_v3(blob, key),
        4 => chunked::decrypt_v4(blob, key),
        other => Err(BlobError::BadVersion(other)),
    }
}
