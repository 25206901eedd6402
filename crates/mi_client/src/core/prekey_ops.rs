//! Prekey publication and peer bundle fetch (with KT verification).

use tracing::debug;

use mi_e2ee::prekeys::PreKeyBundle;
use mi_proto::frame::FrameType;
use mi_proto::kt_wire::KtProofBundle;
use mi_proto::wire::{self, Reader};

use crate::core::{now_unix, ClientCore, PeerIdentity};
use crate::error::ClientError;

impl ClientCore {
    /// Idempotent: rotates the signed prekey on schedule, expires the old
    /// one past its grace window, and republishes only when needed.
    pub fn ensure_prekeys_published(&mut self) -> Result<(), ClientError> {
        let now = now_unix();
        if self
            .prekeys
            .needs_rotation(now, self.config.prekey_rotation_secs)
        {
            self.prekeys.rotate_signed(&self.identity, now);
            debug!("signed prekey rotated");
        }
        self.prekeys.expire_previous(now, self.config.prekey_grace_secs);
        self.prekeys.refill_one_time(mi_e2ee::prekeys::DEFAULT_ONE_TIME_BATCH);

        if self.prekeys.published {
            return Ok(());
        }

        let bundle = self.prekeys.bundle(&self.username, &self.identity);
        let mut payload = Vec::new();
        wire::write_bytes(&bundle.encode()?, &mut payload)?;
        let one_time = &self.prekeys.one_time;
        wire::write_u32(one_time.len() as u32, &mut payload);
        for key in one_time {
            wire::write_u32(key.id, &mut payload);
            wire::write_arr32(&key.public, &mut payload);
        }
        self.process_encrypted(FrameType::PublishPreKeys, &payload)?;

        self.prekeys.published = true;
        self.store.store_prekeys(&self.prekeys)?;
        debug!("prekeys published");
        Ok(())
    }

    /// Fetch a peer's bundle; every fetch must carry KT proofs and they are
    /// verified (inclusion, consistency, STH signature) before the bundle
    /// is believed. The snapshot advances atomically on success.
    pub fn fetch_prekey_bundle(&mut self, peer: &str) -> Result<PreKeyBundle, ClientError> {
        if peer.is_empty() {
            return Err(ClientError::InvalidInput("peer empty".into()));
        }
        // Our last-known tree size rides along so the relay can attach a
        // consistency proof from exactly that point.
        let known_size = self.kt.snapshot().map(|s| s.tree_size).unwrap_or(0);
        let mut payload = Vec::new();
        wire::write_string(peer, &mut payload)?;
        wire::write_u64(known_size, &mut payload);
        let response = self.process_encrypted(FrameType::FetchPreKeyBundle, &payload)?;

        let mut r = Reader::new(&response);
        let bundle_bytes = r.read_bytes()?;
        let proofs = KtProofBundle::read_from(&mut r)?;
        r.finish()?;

        let bundle = PreKeyBundle::decode(&bundle_bytes)?;
        if bundle.username != peer {
            return Err(ClientError::TrustViolation(
                "bundle is for a different user".into(),
            ));
        }
        bundle.verify()?;

        let snapshot =
            self.kt
                .verify_bundle(peer, &bundle.sign_public, &bundle.dh_public, &proofs)?;
        self.store.store_kt_snapshot(&snapshot)?;

        self.known_identities.insert(
            peer.to_string(),
            PeerIdentity {
                sign_public: bundle.sign_public,
                dh_public: bundle.dh_public,
            },
        );
        Ok(bundle)
    }

    /// The KT-verified identity for `peer`, fetching the bundle if this is
    /// the first time we need it.
    pub(crate) fn peer_identity(&mut self, peer: &str) -> Result<PeerIdentity, ClientError> {
        if let Some(identity) = self.known_identities.get(peer) {
            return Ok(*identity);
        }
        self.fetch_prekey_bundle(peer)?;
        self.known_identities
            .get(peer)
            .copied()
            .ok_or_else(|| ClientError::TrustViolation(format!("identity for {peer} unavailable")))
    }

    /// SAS for a peer, for out-of-band comparison before trusting.
    pub fn peer_sas(&mut self, peer: &str) -> Result<String, ClientError> {
        let identity = self.peer_identity(peer)?;
        let fp = mi_crypto::identity::fingerprint(&identity.sign_public, &identity.dh_public);
        Ok(mi_crypto::identity::sas_string(&fp))
    }

    /// The user compared the SAS and confirmed it; mark the peer trusted.
    pub fn trust_pending_peer(&mut self, peer: &str) -> Result<(), ClientError> {
        let identity = self.peer_identity(peer)?;
        let fp = mi_crypto::identity::fingerprint(&identity.sign_public, &identity.dh_public);
        self.pairwise.trust.trust_peer(peer, fp);
        self.store.store_peer_trust(&self.pairwise.trust)?;
        Ok(())
    }

    /// Fetch a consistency proof `old → new` for gossip reconciliation.
    pub(crate) fn fetch_kt_consistency(
        &mut self,
        from_size: u64,
        to_size: u64,
    ) -> Result<Vec<[u8; 32]>, ClientError> {
        let mut payload = Vec::new();
        wire::write_u64(from_size, &mut payload);
        wire::write_u64(to_size, &mut payload);
        let response = self.process_encrypted(FrameType::FetchKtConsistency, &payload)?;
        let mut r = Reader::new(&response);
        let count = r.read_u32()? as usize;
        if count > 64 {
            return Err(ClientError::ProtocolInvalid("consistency proof too long".into()));
        }
        let mut proof = Vec::with_capacity(count);
        for _ in 0..count {
            proof.push(r.read_arr32()?);
        }
        r.finish()?;
        Ok(proof)
    }
}
