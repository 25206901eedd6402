//! Merkle proof replay.
//!
//! The log is an RFC 6962-shaped binary Merkle tree: a subtree over n > 1
//! leaves splits at k, the largest power of two strictly less than n, with
//! indices m < k going left. Leaf hashes carry a protocol domain tag instead
//! of the 0x00 prefix; interior nodes use the 0x01 prefix.

use mi_crypto::{ct, hash};

const LEAF_TAG: &[u8] = b"mi_e2ee_kt_leaf_v1";

/// Leaf hash over the identity binding the log commits to.
pub fn leaf_hash(username: &str, sign_public: &[u8; 32], dh_public: &[u8; 32]) -> [u8; 32] {
    let name_len = (username.len() as u16).to_le_bytes();
    hash::sha256_tagged(
        LEAF_TAG,
        &[&name_len, username.as_bytes(), sign_public, dh_public],
    )
}

/// Interior node hash.
pub fn node_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    hash::sha256_tagged(&[0x01], &[left, right])
}

/// Largest power of two strictly less than `n` (n must be > 1).
fn split_point(n: u64) -> u64 {
    let mut k = 1u64;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Replay an audit path: reconstruct the root of a `tree_size` tree from the
/// leaf hash at `leaf_index`. Returns `None` if the path is malformed, has
/// unused nodes, or the index is out of range.
pub fn root_from_audit(
    leaf: &[u8; 32],
    leaf_index: u64,
    tree_size: u64,
    path: &[[u8; 32]],
) -> Option<[u8; 32]> {
    if tree_size == 0 || leaf_index >= tree_size {
        return None;
    }
    let mut used = path.len();
    let root = replay_subtree(leaf, leaf_index, tree_size, path, &mut used)?;
    // every supplied node must have been consumed
    if used != 0 {
        return None;
    }
    Some(root)
}

/// Recursive replay; siblings are consumed from the END of `path` at each
/// split on the way down (the path is ordered leaf → root).
fn replay_subtree(
    leaf: &[u8; 32],
    index: u64,
    size: u64,
    path: &[[u8; 32]],
    used: &mut usize,
) -> Option<[u8; 32]> {
    if size == 1 {
        return Some(*leaf);
    }
    if *used == 0 {
        return None;
    }
    *used -= 1;
    let sibling = path[*used];
    let k = split_point(size);
    if index < k {
        let left = replay_subtree(leaf, index, k, path, used)?;
        Some(node_hash(&left, &sibling))
    } else {
        let right = replay_subtree(leaf, index - k, size - k, path, used)?;
        Some(node_hash(&sibling, &right))
    }
}

/// Replay a consistency proof between two tree heads.
///
/// Returns true iff `proof` shows the `old_size` tree with `old_root` is a
/// prefix of the `new_size` tree with `new_root`. Rollbacks and split views
/// fail here; a caller with no prior snapshot must not call this.
pub fn verify_consistency(
    old_size: u64,
    new_size: u64,
    old_root: &[u8; 32],
    new_root: &[u8; 32],
    proof: &[[u8; 32]],
) -> bool {
    if old_size == 0 || old_size > new_size {
        return false;
    }
    if old_size == new_size {
        return proof.is_empty() && ct::ct_eq(old_root, new_root);
    }

    let mut node = old_size - 1;
    let mut last_node = new_size - 1;
    while node % 2 == 1 {
        node /= 2;
        last_node /= 2;
    }

    let mut iter = proof.iter();
    let (mut new_hash, mut old_hash) = if node != 0 {
        match iter.next() {
            Some(h) => (*h, *h),
            None => return false,
        }
    } else {
        (*old_root, *old_root)
    };

    while node != 0 {
        if node % 2 == 1 {
            let Some(h) = iter.next() else { return false };
            new_hash = node_hash(h, &new_hash);
            old_hash = node_hash(h, &old_hash);
        } else if node < last_node {
            let Some(h) = iter.next() else { return false };
            new_hash = node_hash(&new_hash, h);
        }
        node /= 2;
        last_node /= 2;
    }
    while last_node != 0 {
        let Some(h) = iter.next() else { return false };
        new_hash = node_hash(&new_hash, h);
        last_node /= 2;
    }

    iter.next().is_none() && ct::ct_eq(&new_hash, new_root) && ct::ct_eq(&old_hash, old_root)
}
