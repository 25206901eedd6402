//! Peer trust store.
//!
//! Key-change policy (NON-NEGOTIABLE): encryption to a peer requires a
//! VERIFIED fingerprint match. If a stored fingerprint ever differs from the
//! one presented, the peer is blocked in both directions until the user
//! re-verifies over the SAS. Inbound traffic from unknown peers is recorded
//! unverified so history survives, but sending stays gated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mi_crypto::identity;

use crate::error::E2eeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub fingerprint: [u8; 32],
    pub verified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// Verified and matching.
    Trusted,
    /// Seen before, never SAS-confirmed.
    UnverifiedMatch,
    /// Never seen.
    Unknown,
    /// Stored fingerprint differs. Blocked.
    Changed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerTrust {
    entries: HashMap<String, PeerEntry>,
}

impl PeerTrust {
    pub fn status(&self, peer: &str, fingerprint: &[u8; 32]) -> TrustStatus {
        match self.entries.get(peer) {
            None => TrustStatus::Unknown,
            Some(entry) => {
                if !identity::fingerprints_match(&entry.fingerprint, fingerprint) {
                    TrustStatus::Changed
                } else if entry.verified {
                    TrustStatus::Trusted
                } else {
                    TrustStatus::UnverifiedMatch
                }
            }
        }
    }

    /// Gate applied before the first (and every) encryption to a peer.
    pub fn require_trusted_for_send(
        &self,
        peer: &str,
        fingerprint: &[u8; 32],
    ) -> Result<(), E2eeError> {
        match self.status(peer, fingerprint) {
            TrustStatus::Trusted => Ok(()),
            TrustStatus::Changed => Err(E2eeError::KeyChanged(peer.to_string())),
            _ => Err(E2eeError::PeerNotTrusted(peer.to_string())),
        }
    }

    /// Record an inbound identity; refuses on key change.
    pub fn observe_inbound(&mut self, peer: &str, fingerprint: &[u8; 32]) -> Result<(), E2eeError> {
        match self.status(peer, fingerprint) {
            TrustStatus::Changed => Err(E2eeError::KeyChanged(peer.to_string())),
            TrustStatus::Unknown => {
                self.entries.insert(
                    peer.to_string(),
                    PeerEntry {
                        fingerprint: *fingerprint,
                        verified: false,
                    },
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Mark a peer verified after the user confirmed the SAS.
    pub fn trust_peer(&mut self, peer: &str, fingerprint: [u8; 32]) {
        self.entries.insert(
            peer.to_string(),
            PeerEntry {
                fingerprint,
                verified: true,
            },
        );
    }

    /// Forget a peer entirely (used for explicit re-verification).
    pub fn revoke(&mut self, peer: &str) {
        self.entries.remove(peer);
    }

    pub fn entry(&self, peer: &str) -> Option<&PeerEntry> {
        self.entries.get(peer)
    }

    /// SAS the user compares out-of-band before trusting.
    pub fn sas_for(fingerprint: &[u8; 32]) -> String {
        identity::sas_string(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_then_observed_then_trusted() {
        let mut trust = PeerTrust::default();
        let fp = [7u8; 32];
        assert_eq!(trust.status("bob", &fp), TrustStatus::Unknown);
        assert!(trust.require_trusted_for_send("bob", &fp).is_err());

        trust.observe_inbound("bob", &fp).unwrap();
        assert_eq!(trust.status("bob", &fp), TrustStatus::UnverifiedMatch);
        assert!(trust.require_trusted_for_send("bob", &fp).is_err());

        trust.trust_peer("bob", fp);
        assert_eq!(trust.status("bob", &fp), TrustStatus::Trusted);
        trust.require_trusted_for_send("bob", &fp).unwrap();
    }

    #[test]
    fn key_change_blocks_both_directions() {
        let mut trust = PeerTrust::default();
        trust.trust_peer("bob", [7u8; 32]);
        let new_fp = [8u8; 32];
        assert_eq!(trust.status("bob", &new_fp), TrustStatus::Changed);
        assert!(matches!(
            trust.require_trusted_for_send("bob", &new_fp),
            Err(E2eeError::KeyChanged(_))
        ));
        assert!(matches!(
            trust.observe_inbound("bob", &new_fp),
            Err(E2eeError::KeyChanged(_))
        ));
        // explicit re-verification path
        trust.revoke("bob");
        trust.trust_peer("bob", new_fp);
        trust.require_trusted_for_send("bob", &new_fp).unwrap();
    }
}
