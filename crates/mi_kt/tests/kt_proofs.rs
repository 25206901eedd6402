//! End-to-end proof verification against a reference in-memory log.

use mi_crypto::identity::IdentityKeyset;
use mi_kt::merkle::{self, leaf_hash, node_hash};
use mi_kt::sth::sth_transcript;
use mi_kt::{GossipOutcome, KtClient, KtPolicy, KtSnapshot};
use mi_proto::gossip::GossipHeader;
use mi_proto::kt_wire::KtProofBundle;

/// Minimal honest log: computes roots, audit paths, and consistency proofs
/// with the same split rule the client replays.
struct RefLog {
    leaves: Vec<[u8; 32]>,
}

impl RefLog {
    fn root_of(&self, lo: usize, hi: usize) -> [u8; 32] {
        let n = hi - lo;
        if n == 1 {
            return self.leaves[lo];
        }
        let k = largest_pow2_lt(n);
        node_hash(&self.root_of(lo, lo + k), &self.root_of(lo + k, hi))
    }

    fn root(&self, size: usize) -> [u8; 32] {
        self.root_of(0, size)
    }

    fn audit_path(&self, index: usize, size: usize) -> Vec<[u8; 32]> {
        self.audit_path_in(index, 0, size)
    }

    fn audit_path_in(&self, index: usize, lo: usize, hi: usize) -> Vec<[u8; 32]> {
        let n = hi - lo;
        if n == 1 {
            return Vec::new();
        }
        let k = largest_pow2_lt(n);
        if index - lo < k {
            let mut path = self.audit_path_in(index, lo, lo + k);
            path.push(self.root_of(lo + k, hi));
            path
        } else {
            let mut path = self.audit_path_in(index, lo + k, hi);
            path.push(self.root_of(lo, lo + k));
            path
        }
    }

    fn consistency(&self, old: usize, new: usize) -> Vec<[u8; 32]> {
        self.subproof(old, 0, new, true)
    }

    fn subproof(&self, m: usize, lo: usize, hi: usize, complete: bool) -> Vec<[u8; 32]> {
        let n = hi - lo;
        if m == n {
            if complete {
                return Vec::new();
            }
            return vec![self.root_of(lo, hi)];
        }
        let k = largest_pow2_lt(n);
        if m <= k {
            let mut proof = self.subproof(m, lo, lo + k, complete);
            proof.push(self.root_of(lo + k, hi));
            proof
        } else {
            let mut proof = self.subproof(m - k, lo + k, hi, false);
            proof.push(self.root_of(lo, lo + k));
            proof
        }
    }
}

fn largest_pow2_lt(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

fn make_log(n: usize) -> RefLog {
    let leaves = (0..n)
        .map(|i| {
            leaf_hash(
                &format!("user{i}"),
                &[(i as u8).wrapping_mul(3); 32],
                &[(i as u8).wrapping_mul(7); 32],
            )
        })
        .collect();
    RefLog { leaves }
}

#[test]
fn audit_paths_verify_for_every_leaf_and_size() {
    let log = make_log(20);
    for size in 1..=20usize {
        let root = log.root(size);
        for index in 0..size {
            let path = log.audit_path(index, size);
            let got = merkle::root_from_audit(&log.leaves[index], index as u64, size as u64, &path)
                .expect("path replays");
            assert_eq!(got, root, "size={size} index={index}");
        }
    }
}

#[test]
fn audit_path_with_wrong_index_fails() {
    let log = make_log(8);
    let path = log.audit_path(3, 8);
    let root = log.root(8);
    let got = merkle::root_from_audit(&log.leaves[3], 2, 8, &path).unwrap();
    assert_ne!(got, root);
}

#[test]
fn consistency_verifies_for_every_size_pair() {
    let log = make_log(16);
    for old in 1..=16usize {
        for new in old..=16usize {
            let proof = log.consistency(old, new);
            assert!(
                merkle::verify_consistency(
                    old as u64,
                    new as u64,
                    &log.root(old),
                    &log.root(new),
                    &proof
                ),
                "old={old} new={new}"
            );
        }
    }
}

#[test]
fn consistency_rejects_forged_new_root() {
    let log = make_log(12);
    let proof = log.consistency(5, 12);
    assert!(!merkle::verify_consistency(
        5,
        12,
        &log.root(5),
        &[0xEEu8; 32],
        &proof
    ));
}

#[test]
fn consistency_rejects_rollback_and_extra_nodes() {
    let log = make_log(12);
    assert!(!merkle::verify_consistency(
        12,
        5,
        &log.root(12),
        &log.root(5),
        &[]
    ));
    let mut proof = log.consistency(5, 12);
    proof.push([7u8; 32]);
    assert!(!merkle::verify_consistency(
        5,
        12,
        &log.root(5),
        &log.root(12),
        &proof
    ));
}

fn bundle_for(
    log: &RefLog,
    signer: &IdentityKeyset,
    index: usize,
    old_size: usize,
    size: usize,
) -> KtProofBundle {
    let root = log.root(size);
    KtProofBundle {
        tree_size: size as u64,
        root,
        leaf_index: index as u64,
        audit_path: log.audit_path(index, size),
        consistency: if old_size == 0 {
            Vec::new()
        } else {
            log.consistency(old_size, size)
        },
        sth_sig: signer.sign(&sth_transcript(size as u64, &root)).to_vec(),
    }
}

#[test]
fn client_accepts_honest_log_and_advances() {
    let sth = IdentityKeyset::generate();
    let log = make_log(10);
    let mut kt = KtClient::new(KtPolicy::default(), Some(*sth.sign_public()), None);

    // user3 = leaf index 3 with the keys make_log used
    let bundle = bundle_for(&log, &sth, 3, 0, 6);
    kt.verify_bundle("user3", &[9u8; 32], &[21u8; 32], &bundle)
        .expect("first fetch verifies");
    assert_eq!(kt.snapshot().unwrap().tree_size, 6);

    let bundle = bundle_for(&log, &sth, 3, 6, 10);
    kt.verify_bundle("user3", &[9u8; 32], &[21u8; 32], &bundle)
        .expect("growth verifies");
    assert_eq!(kt.snapshot().unwrap().tree_size, 10);
}

#[test]
fn client_rejects_rollback_and_latches_after_threshold() {
    let sth = IdentityKeyset::generate();
    let log = make_log(10);
    let snap = KtSnapshot {
        tree_size: 10,
        root: log.root(10),
        verified: true,
    };
    let mut kt = KtClient::new(KtPolicy::default(), Some(*sth.sign_public()), Some(snap));

    let bundle = bundle_for(&log, &sth, 3, 0, 9);
    let err = kt
        .verify_bundle("user3", &[9u8; 32], &[21u8; 32], &bundle)
        .unwrap_err();
    assert!(matches!(err, mi_kt::KtError::Rollback { old: 10, new: 9 }));
    // snapshot untouched, mismatch recorded
    assert_eq!(kt.snapshot().unwrap().tree_size, 10);
    assert_eq!(kt.mismatch_count(), 1);
    assert!(!kt.alert());

    // Two more rollback responses reach the default threshold of 3 and
    // latch the alert.
    for _ in 0..2 {
        assert!(kt
            .verify_bundle("user3", &[9u8; 32], &[21u8; 32], &bundle)
            .is_err());
    }
    assert_eq!(kt.mismatch_count(), 3);
    assert!(kt.alert());
}

#[test]
fn client_rejects_split_view_and_counts_mismatch() {
    let sth = IdentityKeyset::generate();
    let log = make_log(10);
    let snap = KtSnapshot {
        tree_size: 10,
        root: [0xEEu8; 32], // disagrees with the log's real size-10 root
        verified: true,
    };
    let mut kt = KtClient::new(KtPolicy::default(), Some(*sth.sign_public()), Some(snap));

    let bundle = bundle_for(&log, &sth, 3, 0, 10);
    let err = kt
        .verify_bundle("user3", &[9u8; 32], &[21u8; 32], &bundle)
        .unwrap_err();
    assert_eq!(err, mi_kt::KtError::SplitView);
    assert_eq!(kt.snapshot().unwrap().root, [0xEEu8; 32]);
    assert_eq!(kt.mismatch_count(), 1);
}

#[test]
fn client_rejects_bad_consistency_and_counts_mismatch() {
    let sth = IdentityKeyset::generate();
    let log = make_log(12);
    let snap = KtSnapshot {
        tree_size: 5,
        root: log.root(5),
        verified: true,
    };
    let mut kt = KtClient::new(KtPolicy::default(), Some(*sth.sign_public()), Some(snap));

    // Inclusion and STH check out, but the consistency nodes are garbage.
    let mut bundle = bundle_for(&log, &sth, 3, 5, 12);
    for node in bundle.consistency.iter_mut() {
        node[0] ^= 0xFF;
    }
    let err = kt
        .verify_bundle("user3", &[9u8; 32], &[21u8; 32], &bundle)
        .unwrap_err();
    assert_eq!(err, mi_kt::KtError::ConsistencyInvalid);
    assert_eq!(kt.snapshot().unwrap().tree_size, 5);
    assert_eq!(kt.mismatch_count(), 1);
}

#[test]
fn gossip_need_proof_then_advance() {
    let log = make_log(14);
    let snap = KtSnapshot {
        tree_size: 8,
        root: log.root(8),
        verified: true,
    };
    let mut kt = KtClient::new(KtPolicy::default(), None, Some(snap));
    let header = GossipHeader {
        tree_size: 14,
        root: log.root(14),
    };
    let outcome = kt.observe_gossip(&header);
    assert_eq!(
        outcome,
        GossipOutcome::NeedProof {
            from_size: 8,
            to_size: 14
        }
    );
    kt.apply_gossip_proof(&header, &log.consistency(8, 14))
        .expect("honest proof advances");
    assert_eq!(kt.snapshot().unwrap().tree_size, 14);

    // A forged follow-up increments the mismatch counter.
    let forged = GossipHeader {
        tree_size: 15,
        root: [0xAB; 32],
    };
    assert!(kt.apply_gossip_proof(&forged, &[]).is_err());
    assert_eq!(kt.mismatch_count(), 1);
}
