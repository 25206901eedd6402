//! Length-hiding padding.
//!
//! Every ratcheted plaintext is padded to a fixed bucket before sealing so
//! ciphertext length leaks at most the bucket. Layout:
//!
//!   [ true_len: u32 LE | reserved: u32 = 0 | plaintext | random fill ]
//!
//! Buckets: 256, 512, 1024, 2048, 4096, 8192, 16384. Larger payloads round
//! up to the next 4096 multiple. The fill is random, never zeros, so a
//! compressing transport cannot squeeze the padding back out.

use rand::RngCore;

use crate::error::ProtoError;

pub const PAD_HEADER_LEN: usize = 8;
pub const PAD_BUCKETS: &[usize] = &[256, 512, 1024, 2048, 4096, 8192, 16384];
const PAD_STEP: usize = 4096;

/// Smallest legal padded size for `plain_len` bytes of payload.
pub fn bucket_for(plain_len: usize) -> usize {
    let needed = PAD_HEADER_LEN + plain_len;
    for &b in PAD_BUCKETS {
        if b >= needed {
            return b;
        }
    }
    needed.div_ceil(PAD_STEP) * PAD_STEP
}

pub fn pad(plaintext: &[u8]) -> Vec<u8> {
    let target = bucket_for(plaintext.len());
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(plaintext.len() as u32).to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(plaintext);
    let fill = target - out.len();
    if fill > 0 {
        let mut tail = vec![0u8; fill];
        rand::rngs::OsRng.fill_bytes(&mut tail);
        out.extend_from_slice(&tail);
    }
    out
}

pub fn unpad(padded: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if padded.len() < PAD_HEADER_LEN {
        return Err(ProtoError::InvalidPadding);
    }
    let len = u32::from_le_bytes(padded[..4].try_into().expect("len")) as usize;
    if padded[4..8] != [0u8; 4] {
        return Err(ProtoError::InvalidPadding);
    }
    if PAD_HEADER_LEN + len > padded.len() {
        return Err(ProtoError::InvalidPadding);
    }
    Ok(padded[PAD_HEADER_LEN..PAD_HEADER_LEN + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_in_first_bucket() {
        let msg = vec![0x42u8; 100];
        let padded = pad(&msg);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn all_bucket_boundaries() {
        // len + header exactly at a boundary stays in that bucket
        for &b in PAD_BUCKETS {
            let msg = vec![1u8; b - PAD_HEADER_LEN];
            assert_eq!(pad(&msg).len(), b);
            // one more byte spills into the next size
            let msg = vec![1u8; b - PAD_HEADER_LEN + 1];
            assert!(pad(&msg).len() > b);
        }
    }

    #[test]
    fn oversize_rounds_to_4096_multiple() {
        let msg = vec![7u8; 20_000];
        let padded = pad(&msg);
        assert_eq!(padded.len(), 20_480);
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn empty_plaintext_pads_to_smallest_bucket() {
        let padded = pad(&[]);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn bogus_length_rejected() {
        let mut padded = pad(b"hello");
        padded[..4].copy_from_slice(&(10_000u32).to_le_bytes());
        assert!(unpad(&padded).is_err());
    }
}
