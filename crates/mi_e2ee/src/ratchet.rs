//! Double Ratchet with DH ratchet steps.
//!
//! State separation:
//!   RK  — root key (updated on every DH ratchet step)
//!   CKs — sending chain key (updated per message)
//!   CKr — receiving chain key (updated per message)
//!   MK  — message key (derived from CK, used once, then erased)
//!
//! A DH ratchet step happens exactly when an inbound header advertises a new
//! peer ratchet public key. Skipped message keys are held in insertion order
//! and evicted FIFO past the cap; a key that decrypts a message is removed
//! in the same step.
//!
//! Callers that must not advance state on authentication failure decrypt on
//! a clone and commit it afterwards (see `engine::open_message`).

use std::collections::VecDeque;

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use mi_crypto::kdf;
use mi_proto::wire::{self, Reader};
use mi_proto::ProtoError;

use crate::error::E2eeError;

/// Most intermediate keys one decrypt call may derive.
pub const MAX_SKIP: u64 = 4096;
/// Most skipped keys retained; oldest evicted first.
pub const MAX_STORED_SKIPPED: usize = 2048;

const ROOT_INFO: &[u8] = b"mi_e2ee_ratchet_root_v1";
const CHAIN_INFO: &[u8] = b"mi_e2ee_ratchet_chain_v1";

/// Sent unencrypted alongside every ciphertext (inside the session channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    pub dh_public: [u8; 32],
    /// Message number in the current sending chain.
    pub n: u64,
    /// Length of the previous sending chain.
    pub pn: u64,
}

impl RatchetHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(48);
        wire::write_arr32(&self.dh_public, &mut out);
        wire::write_u64(self.n, &mut out);
        wire::write_u64(self.pn, &mut out);
        out
    }

    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        Ok(Self {
            dh_public: r.read_arr32()?,
            n: r.read_u64()?,
            pn: r.read_u64()?,
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    dh_public: [u8; 32],
    n: u64,
    mk: [u8; 32],
}

/// Complete pairwise ratchet state. Persisted wrapped by the secret store.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetSession {
    pub peer: String,

    root_key: [u8; 32],

    dh_send_secret: [u8; 32],
    dh_send_public: [u8; 32],
    send_ck: [u8; 32],
    pub send_n: u64,
    pub prev_send_n: u64,

    dh_recv_public: Option<[u8; 32]>,
    recv_ck: [u8; 32],
    pub recv_n: u64,

    skipped: VecDeque<SkippedKey>,

    /// Increments on every DH ratchet step.
    pub ratchet_epoch: u64,
    /// True once any inbound message decrypted; the init header can stop
    /// accompanying outbound messages after that.
    pub received_any: bool,
    /// Encoded X3DH init header, attached to outbound messages until the
    /// peer demonstrably holds the session.
    pub pending_init: Option<Vec<u8>>,
}

impl Drop for RatchetSession {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.dh_send_secret.zeroize();
        self.send_ck.zeroize();
        self.recv_ck.zeroize();
        for s in self.skipped.iter_mut() {
            s.mk.zeroize();
        }
    }
}

impl RatchetSession {
    /// Initiator: the peer's signed prekey is the first ratchet key; one DH
    /// step runs immediately so the first message is already ratcheted.
    pub fn init_initiator(
        peer: String,
        shared_root: &[u8; 32],
        peer_spk_public: &[u8; 32],
    ) -> Result<Self, E2eeError> {
        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let dh_public = X25519Public::from(&dh_secret).to_bytes();
        let dh_out = dh_secret.diffie_hellman(&X25519Public::from(*peer_spk_public));
        let (root_key, send_ck) = kdf_root(shared_root, dh_out.as_bytes())?;

        Ok(Self {
            peer,
            root_key,
            dh_send_secret: dh_secret.to_bytes(),
            dh_send_public: dh_public,
            send_ck,
            send_n: 0,
            prev_send_n: 0,
            dh_recv_public: Some(*peer_spk_public),
            recv_ck: [0u8; 32],
            recv_n: 0,
            skipped: VecDeque::new(),
            ratchet_epoch: 1,
            received_any: false,
            pending_init: None,
        })
    }

    /// Responder: the SPK secret seeds the ratchet; the first DH step runs
    /// when the initiator's first message arrives.
    pub fn init_responder(
        peer: String,
        shared_root: &[u8; 32],
        spk_secret: &StaticSecret,
    ) -> Self {
        let dh_public = X25519Public::from(spk_secret).to_bytes();
        Self {
            peer,
            root_key: *shared_root,
            dh_send_secret: spk_secret.to_bytes(),
            dh_send_public: dh_public,
            send_ck: [0u8; 32],
            send_n: 0,
            prev_send_n: 0,
            dh_recv_public: None,
            recv_ck: [0u8; 32],
            recv_n: 0,
            skipped: VecDeque::new(),
            ratchet_epoch: 0,
            received_any: false,
            pending_init: None,
        }
    }

    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Advance the sending chain one step; returns the header to send and
    /// the one-use message key.
    pub fn encrypt_step(&mut self) -> Result<(RatchetHeader, Zeroizing<[u8; 32]>), E2eeError> {
        let (next_ck, mk) = kdf_chain(&self.send_ck)?;
        self.send_ck.zeroize();
        self.send_ck = next_ck;
        let header = RatchetHeader {
            dh_public: self.dh_send_public,
            n: self.send_n,
            pn: self.prev_send_n,
        };
        self.send_n += 1;
        Ok((header, mk))
    }

    /// Derive the message key for an inbound header. Mutates chain state;
    /// callers needing failure atomicity run this on a clone.
    pub fn decrypt_step(&mut self, header: &RatchetHeader) -> Result<Zeroizing<[u8; 32]>, E2eeError> {
        // Skipped key hit: consume and erase.
        if let Some(idx) = self
            .skipped
            .iter()
            .position(|s| s.dh_public == header.dh_public && s.n == header.n)
        {
            let mut entry = self.skipped.remove(idx).expect("index valid");
            let mk = Zeroizing::new(entry.mk);
            entry.mk.zeroize();
            self.received_any = true;
            return Ok(mk);
        }

        let need_dh_ratchet = match self.dh_recv_public {
            Some(current) => current != header.dh_public,
            None => true,
        };

        if need_dh_ratchet {
            // Cache the rest of the outgoing peer chain we might still see.
            if self.dh_recv_public.is_some() {
                self.skip_to(header.pn)?;
            }
            self.dh_recv_public = Some(header.dh_public);

            let peer_dh = X25519Public::from(header.dh_public);
            let dh_recv = StaticSecret::from(self.dh_send_secret).diffie_hellman(&peer_dh);
            let (new_root, new_recv_ck) = kdf_root(&self.root_key, dh_recv.as_bytes())?;
            self.root_key.zeroize();
            self.root_key = new_root;
            self.recv_ck.zeroize();
            self.recv_ck = new_recv_ck;
            self.recv_n = 0;

            // New sending ratchet key for our next turn.
            self.prev_send_n = self.send_n;
            self.send_n = 0;
            let new_dh = StaticSecret::random_from_rng(OsRng);
            self.dh_send_public = X25519Public::from(&new_dh).to_bytes();
            let dh_send = new_dh.diffie_hellman(&peer_dh);
            let (new_root2, new_send_ck) = kdf_root(&self.root_key, dh_send.as_bytes())?;
            self.root_key.zeroize();
            self.root_key = new_root2;
            self.send_ck.zeroize();
            self.send_ck = new_send_ck;
            self.dh_send_secret.zeroize();
            self.dh_send_secret = new_dh.to_bytes();
            self.ratchet_epoch += 1;
        }

        self.skip_to(header.n)?;

        let (next_ck, mk) = kdf_chain(&self.recv_ck)?;
        self.recv_ck.zeroize();
        self.recv_ck = next_ck;
        self.recv_n += 1;
        self.received_any = true;
        Ok(mk)
    }

    /// Derive and store message keys from `recv_n` up to (excluding) `until`.
    fn skip_to(&mut self, until: u64) -> Result<(), E2eeError> {
        if until <= self.recv_n {
            return Ok(());
        }
        if until - self.recv_n > MAX_SKIP {
            return Err(E2eeError::SkipBudgetExceeded);
        }
        let dh_public = self.dh_recv_public.unwrap_or([0u8; 32]);
        while self.recv_n < until {
            let (next_ck, mk) = kdf_chain(&self.recv_ck)?;
            self.recv_ck.zeroize();
            self.recv_ck = next_ck;
            self.skipped.push_back(SkippedKey {
                dh_public,
                n: self.recv_n,
                mk: *mk,
            });
            self.recv_n += 1;
        }
        while self.skipped.len() > MAX_STORED_SKIPPED {
            if let Some(mut old) = self.skipped.pop_front() {
                old.mk.zeroize();
            }
        }
        Ok(())
    }
}

/// KDF_RK: (root, dh_output) → (root', chain_key).
fn kdf_root(root: &[u8; 32], dh_output: &[u8]) -> Result<([u8; 32], [u8; 32]), E2eeError> {
    let mut okm = Zeroizing::new([0u8; 64]);
    kdf::hkdf_expand(dh_output, Some(root), ROOT_INFO, okm.as_mut())?;
    let mut new_root = [0u8; 32];
    let mut ck = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    Ok((new_root, ck))
}

/// KDF_CK: chain key → (chain_key', message_key).
fn kdf_chain(ck: &[u8; 32]) -> Result<([u8; 32], Zeroizing<[u8; 32]>), E2eeError> {
    let mut okm = Zeroizing::new([0u8; 64]);
    kdf::hkdf_expand(ck, None, CHAIN_INFO, okm.as_mut())?;
    let mut next_ck = [0u8; 32];
    let mut mk = Zeroizing::new([0u8; 32]);
    next_ck.copy_from_slice(&okm[..32]);
    mk.copy_from_slice(&okm[32..]);
    Ok((next_ck, mk))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetSession, RatchetSession) {
        let shared = [42u8; 32];
        let bob_spk = StaticSecret::random_from_rng(OsRng);
        let bob_spk_public = X25519Public::from(&bob_spk).to_bytes();
        let alice =
            RatchetSession::init_initiator("bob".into(), &shared, &bob_spk_public).unwrap();
        let bob = RatchetSession::init_responder("alice".into(), &shared, &bob_spk);
        (alice, bob)
    }

    #[test]
    fn full_ratchet_roundtrip() {
        let (mut alice, mut bob) = pair();

        for i in 0..3 {
            let (header, mk_a) = alice.encrypt_step().unwrap();
            let mk_b = bob.decrypt_step(&header).unwrap();
            assert_eq!(*mk_a, *mk_b, "message {i}");
        }

        // Bob replies (his first send triggers his DH turn already done on recv)
        for i in 0..2 {
            let (header, mk_b) = bob.encrypt_step().unwrap();
            let mk_a = alice.decrypt_step(&header).unwrap();
            assert_eq!(*mk_b, *mk_a, "reply {i}");
        }

        // Alice again (another DH ratchet)
        let epoch_before = bob.ratchet_epoch;
        let (header, mk_a) = alice.encrypt_step().unwrap();
        let mk_b = bob.decrypt_step(&header).unwrap();
        assert_eq!(*mk_a, *mk_b);
        assert!(bob.ratchet_epoch > epoch_before);
    }

    #[test]
    fn out_of_order_uses_skipped_keys_and_drains_them() {
        let (mut alice, mut bob) = pair();

        let (h0, mk0) = alice.encrypt_step().unwrap();
        let (h1, mk1) = alice.encrypt_step().unwrap();
        let (h2, mk2) = alice.encrypt_step().unwrap();

        // delivery order 2, 0, 1
        assert_eq!(*bob.decrypt_step(&h2).unwrap(), *mk2);
        assert_eq!(bob.skipped_len(), 2);
        assert_eq!(*bob.decrypt_step(&h0).unwrap(), *mk0);
        assert_eq!(bob.skipped_len(), 1);
        assert_eq!(*bob.decrypt_step(&h1).unwrap(), *mk1);
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn skip_budget_enforced() {
        let (mut alice, mut bob) = pair();
        let (mut header, _) = alice.encrypt_step().unwrap();
        header.n = MAX_SKIP + 1;
        assert!(matches!(
            bob.decrypt_step(&header),
            Err(E2eeError::SkipBudgetExceeded)
        ));
    }

    #[test]
    fn fifo_eviction_past_cap() {
        let (mut alice, mut bob) = pair();
        // Jump the chain far ahead in two hops so the cap is exceeded.
        for _ in 0..(MAX_STORED_SKIPPED as u64 + 100) {
            let _ = alice.encrypt_step().unwrap();
        }
        let (header, mk) = alice.encrypt_step().unwrap();
        assert_eq!(*bob.decrypt_step(&header).unwrap(), *mk);
        assert_eq!(bob.skipped_len(), MAX_STORED_SKIPPED);
    }

    #[test]
    fn header_roundtrip() {
        let header = RatchetHeader {
            dh_public: [7u8; 32],
            n: 9,
            pn: 4,
        };
        let bytes = header.encode();
        let mut r = Reader::new(&bytes);
        assert_eq!(RatchetHeader::read_from(&mut r).unwrap(), header);
        r.finish().unwrap();
    }

    #[test]
    fn serde_roundtrip_preserves_chains() {
        let (mut alice, mut bob) = pair();
        let (h0, _) = alice.encrypt_step().unwrap();
        bob.decrypt_step(&h0).unwrap();

        let json = serde_json::to_vec(&bob).unwrap();
        let mut restored: RatchetSession = serde_json::from_slice(&json).unwrap();

        let (h1, mk1) = alice.encrypt_step().unwrap();
        assert_eq!(*restored.decrypt_step(&h1).unwrap(), *mk1);
    }
}
