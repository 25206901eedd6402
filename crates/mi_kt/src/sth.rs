//! Signed tree head verification.
//!
//! The log operator signs `(tree_size ∥ root)` with a long-lived Ed25519 key
//! configured out of band. Transcript: tag ∥ u64 size LE ∥ 32B root.

use mi_crypto::identity;

use crate::error::KtError;

const STH_TAG: &[u8] = b"mi_e2ee_kt_sth_v1";

pub fn sth_transcript(tree_size: u64, root: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(STH_TAG.len() + 8 + 32);
    out.extend_from_slice(STH_TAG);
    out.extend_from_slice(&tree_size.to_le_bytes());
    out.extend_from_slice(root);
    out
}

pub fn verify_sth(
    public: &[u8; 32],
    tree_size: u64,
    root: &[u8; 32],
    signature: &[u8],
) -> Result<(), KtError> {
    identity::verify_signature(public, &sth_transcript(tree_size, root), signature)
        .map_err(|_| KtError::SthSignatureInvalid)
}
