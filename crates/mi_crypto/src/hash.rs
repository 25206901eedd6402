//! SHA-256 utilities
//!
//! All protocol digests are SHA-256 with an ASCII domain tag hashed first,
//! so a digest computed for one purpose can never be replayed as another.

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over `tag ∥ part_0 ∥ part_1 ∥ …`.
pub fn sha256_tagged(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_differs_from_plain() {
        let plain = sha256(b"payload");
        let tagged = sha256_tagged(b"tag", &[b"payload"]);
        assert_ne!(plain, tagged);
    }

    #[test]
    fn parts_concatenate() {
        assert_eq!(
            sha256_tagged(b"t", &[b"ab", b"cd"]),
            sha256_tagged(b"t", &[b"abcd"])
        );
    }
}
