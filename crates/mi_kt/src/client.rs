//! KT snapshot state machine.
//!
//! The client keeps one `(tree_size, root)` snapshot per log. Every prekey
//! fetch must carry proofs that advance it monotonically; every inbound
//! gossip header is cross-checked against it. Mismatches past the threshold
//! latch an alert that stays raised until operator action.

use tracing::warn;

use mi_proto::gossip::GossipHeader;
use mi_proto::kt_wire::KtProofBundle;

use crate::error::KtError;
use crate::merkle;
use crate::sth;

pub const SNAPSHOT_MAGIC: [u8; 8] = *b"MIKTSTH1";
pub const SNAPSHOT_LEN: usize = 8 + 8 + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KtSnapshot {
    pub tree_size: u64,
    pub root: [u8; 32],
    pub verified: bool,
}

impl KtSnapshot {
    /// Persisted form: `MIKTSTH1 ∥ u64 tree_size ∥ 32B root`.
    pub fn encode(&self) -> [u8; SNAPSHOT_LEN] {
        let mut out = [0u8; SNAPSHOT_LEN];
        out[..8].copy_from_slice(&SNAPSHOT_MAGIC);
        out[8..16].copy_from_slice(&self.tree_size.to_le_bytes());
        out[16..].copy_from_slice(&self.root);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, KtError> {
        if data.len() != SNAPSHOT_LEN || data[..8] != SNAPSHOT_MAGIC {
            return Err(KtError::SnapshotInvalid);
        }
        Ok(Self {
            tree_size: u64::from_le_bytes(data[8..16].try_into().expect("len")),
            root: data[16..].try_into().expect("len"),
            verified: true,
        })
    }
}

#[derive(Debug, Clone)]
pub struct KtPolicy {
    pub require_sth_signature: bool,
    pub mismatch_alert_threshold: u32,
}

impl Default for KtPolicy {
    fn default() -> Self {
        Self {
            require_sth_signature: true,
            mismatch_alert_threshold: 3,
        }
    }
}

/// What an inbound gossip header means relative to our snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Peer agrees with us, or we have no snapshot yet (header adopted).
    Consistent,
    /// Peer is behind us; nothing to do.
    PeerBehind,
    /// Peer is ahead; fetch a consistency proof from `from_size` to `to_size`
    /// and feed it to [`KtClient::apply_gossip_proof`].
    NeedProof { from_size: u64, to_size: u64 },
    /// Same size, different root — immediate mismatch (already recorded).
    Mismatch,
}

pub struct KtClient {
    policy: KtPolicy,
    sth_public: Option<[u8; 32]>,
    snapshot: Option<KtSnapshot>,
    mismatch_count: u32,
    alert: bool,
}

impl KtClient {
    pub fn new(policy: KtPolicy, sth_public: Option<[u8; 32]>, snapshot: Option<KtSnapshot>) -> Self {
        Self {
            policy,
            sth_public,
            snapshot,
            mismatch_count: 0,
            alert: false,
        }
    }

    pub fn snapshot(&self) -> Option<&KtSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn mismatch_count(&self) -> u32 {
        self.mismatch_count
    }

    pub fn alert(&self) -> bool {
        self.alert
    }

    /// Clear the latched alert after operator intervention.
    pub fn acknowledge_alert(&mut self) {
        self.alert = false;
        self.mismatch_count = 0;
    }

    /// Gossip header advertising our snapshot; `None` until first verified
    /// fetch.
    pub fn gossip_header(&self) -> Option<GossipHeader> {
        self.snapshot.map(|s| GossipHeader {
            tree_size: s.tree_size,
            root: s.root,
        })
    }

    /// Verify the proofs attached to a prekey-bundle fetch and advance the
    /// snapshot. Verification order per the protocol: inclusion, consistency
    /// against the prior snapshot, STH signature, then the atomic overwrite
    /// (the caller persists the returned snapshot).
    ///
    /// Rollbacks, split views, and failed consistency replays count against
    /// the mismatch threshold exactly like gossip disagreements: a relay
    /// serving bad tree heads on the fetch path must latch the alert too.
    pub fn verify_bundle(
        &mut self,
        username: &str,
        sign_public: &[u8; 32],
        dh_public: &[u8; 32],
        bundle: &KtProofBundle,
    ) -> Result<KtSnapshot, KtError> {
        let leaf = merkle::leaf_hash(username, sign_public, dh_public);
        let reconstructed =
            merkle::root_from_audit(&leaf, bundle.leaf_index, bundle.tree_size, &bundle.audit_path)
                .ok_or(KtError::InclusionInvalid)?;
        if !mi_crypto::ct::ct_eq(&reconstructed, &bundle.root) {
            return Err(KtError::InclusionInvalid);
        }

        if let Some(prev) = self.snapshot {
            if bundle.tree_size < prev.tree_size {
                self.record_mismatch();
                return Err(KtError::Rollback {
                    old: prev.tree_size,
                    new: bundle.tree_size,
                });
            }
            if bundle.tree_size == prev.tree_size {
                if !mi_crypto::ct::ct_eq(&bundle.root, &prev.root) {
                    self.record_mismatch();
                    return Err(KtError::SplitView);
                }
            } else if !merkle::verify_consistency(
                prev.tree_size,
                bundle.tree_size,
                &prev.root,
                &bundle.root,
                &bundle.consistency,
            ) {
                self.record_mismatch();
                return Err(KtError::ConsistencyInvalid);
            }
        }

        if self.policy.require_sth_signature {
            let key = self.sth_public.ok_or(KtError::SthKeyMissing)?;
            sth::verify_sth(&key, bundle.tree_size, &bundle.root, &bundle.sth_sig)?;
        }

        let snapshot = KtSnapshot {
            tree_size: bundle.tree_size,
            root: bundle.root,
            verified: true,
        };
        self.snapshot = Some(snapshot);
        Ok(snapshot)
    }

    /// Cross-check an inbound gossip header. Mismatches are recorded here;
    /// the `NeedProof` outcome asks the caller to fetch a consistency proof.
    pub fn observe_gossip(&mut self, header: &GossipHeader) -> GossipOutcome {
        let Some(prev) = self.snapshot else {
            // First sight of any root: adopt it unverified.
            self.snapshot = Some(KtSnapshot {
                tree_size: header.tree_size,
                root: header.root,
                verified: false,
            });
            return GossipOutcome::Consistent;
        };
        if header.tree_size < prev.tree_size {
            return GossipOutcome::PeerBehind;
        }
        if header.tree_size == prev.tree_size {
            if mi_crypto::ct::ct_eq(&header.root, &prev.root) {
                return GossipOutcome::Consistent;
            }
            self.record_mismatch();
            return GossipOutcome::Mismatch;
        }
        GossipOutcome::NeedProof {
            from_size: prev.tree_size,
            to_size: header.tree_size,
        }
    }

    /// Apply the consistency proof fetched for a `NeedProof` outcome.
    /// Success advances the snapshot; failure records a mismatch.
    pub fn apply_gossip_proof(
        &mut self,
        header: &GossipHeader,
        proof: &[[u8; 32]],
    ) -> Result<(), KtError> {
        let Some(prev) = self.snapshot else {
            return Err(KtError::ConsistencyInvalid);
        };
        if merkle::verify_consistency(
            prev.tree_size,
            header.tree_size,
            &prev.root,
            &header.root,
            proof,
        ) {
            self.snapshot = Some(KtSnapshot {
                tree_size: header.tree_size,
                root: header.root,
                verified: prev.verified,
            });
            Ok(())
        } else {
            self.record_mismatch();
            Err(KtError::ConsistencyInvalid)
        }
    }

    pub fn record_mismatch(&mut self) -> bool {
        self.mismatch_count = self.mismatch_count.saturating_add(1);
        if self.mismatch_count >= self.policy.mismatch_alert_threshold {
            if !self.alert {
                warn!(
                    mismatches = self.mismatch_count,
                    "kt gossip alert latched"
                );
            }
            self.alert = true;
        }
        self.alert
    }
}
