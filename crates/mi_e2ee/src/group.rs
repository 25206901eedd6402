//! Sender-Key group engine.
//!
//! One symmetric chain per (group, sender). Each message advances the chain
//! by one KDF step; the message key seals the padded chat envelope and the
//! whole wire is signed by the sender's identity key. Distribution of a
//! fresh chain rides the pairwise ratchet channel and is re-sent to
//! unacknowledged members after a cool-down.
//!
//! Rotation is mandatory when the member set changed since the chain was
//! stamped, after 10 000 messages, after 7 days, or on any membership event.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use mi_crypto::{aead, hash, identity, kdf};
use mi_proto::wire::{self, Reader};
use mi_proto::ProtoError;

use crate::error::E2eeError;

pub const ROTATE_MAX_MESSAGES: u64 = 10_000;
pub const ROTATE_MAX_AGE_SECS: u64 = 7 * 24 * 3600;
pub const DISTRIBUTION_COOLDOWN_SECS: u64 = 5;
pub const GROUP_MAX_SKIP: u32 = 4096;
pub const GROUP_MAX_STORED_SKIPPED: usize = 2048;

const SENDER_CK_INFO: &[u8] = b"mi_e2ee_group_sender_ck_v1";
const MEMBERS_HASH_TAG: &[u8] = b"mi_e2ee_group_members_v1";
const GROUP_MSG_AD_TAG: &[u8] = b"mi_e2ee_group_msg_v1";
const DIST_SIG_TAG: &[u8] = b"mi_e2ee_group_dist_v1";
const CALL_KEY_SIG_TAG: &[u8] = b"mi_e2ee_call_key_v1";

/// Hash over the sorted member list; stamps a chain at rotation time.
pub fn members_hash(members: &[String]) -> [u8; 32] {
    let mut sorted: Vec<&str> = members.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher_input = Vec::new();
    for m in sorted {
        hasher_input.extend_from_slice(&(m.len() as u16).to_le_bytes());
        hasher_input.extend_from_slice(m.as_bytes());
    }
    hash::sha256_tagged(MEMBERS_HASH_TAG, &[&hasher_input])
}

/// One KDF step: `(ck', mk) ← HKDF(ck, info)`.
fn chain_step(ck: &[u8; 32]) -> Result<([u8; 32], Zeroizing<[u8; 32]>), E2eeError> {
    let mut okm = Zeroizing::new([0u8; 64]);
    kdf::hkdf_expand(ck, None, SENDER_CK_INFO, okm.as_mut())?;
    let mut next = [0u8; 32];
    let mut mk = Zeroizing::new([0u8; 32]);
    next.copy_from_slice(&okm[..32]);
    mk.copy_from_slice(&okm[32..]);
    Ok((next, mk))
}

// ── Our own sending chain ────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct SenderChain {
    pub group_id: String,
    pub version: u32,
    chain_key: [u8; 32],
    pub iteration: u32,
    members_hash: [u8; 32],
    pub created_at: u64,
    pub sent_count: u64,
    /// Set by a membership event; forces rotation at the next send.
    dirty: bool,
}

impl Drop for SenderChain {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

impl SenderChain {
    pub fn needs_rotation(&self, current_members: &[String], now: u64) -> bool {
        self.dirty
            || self.members_hash != members_hash(current_members)
            || self.sent_count >= ROTATE_MAX_MESSAGES
            || now.saturating_sub(self.created_at) >= ROTATE_MAX_AGE_SECS
    }
}

// ── Remote sender state ──────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
struct SkippedGroupKey {
    iteration: u32,
    mk: [u8; 32],
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RemoteSenderState {
    pub version: u32,
    chain_key: [u8; 32],
    pub next_iteration: u32,
    skipped: VecDeque<SkippedGroupKey>,
}

impl Drop for RemoteSenderState {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        for s in self.skipped.iter_mut() {
            s.mk.zeroize();
        }
    }
}

// ── Pending distribution tracking ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDistribution {
    pub group_id: String,
    pub version: u32,
    /// Members who have not acked the distribution yet.
    pub outstanding: HashSet<String>,
    pub last_sent: u64,
}

impl PendingDistribution {
    pub fn due_for_resend(&self, now: u64) -> bool {
        !self.outstanding.is_empty()
            && now.saturating_sub(self.last_sent) >= DISTRIBUTION_COOLDOWN_SECS
    }
}

// ── Group call keys ──────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize)]
pub struct CallKey {
    pub key_id: u32,
    key: [u8; 32],
}

impl Drop for CallKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl CallKey {
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Signing payload for a call-key distribution envelope.
pub fn call_key_sig_payload(group_id: &str, call_id: &[u8; 16], key_id: u32, key: &[u8; 32]) -> Vec<u8> {
    let mut out = CALL_KEY_SIG_TAG.to_vec();
    out.extend_from_slice(&(group_id.len() as u16).to_le_bytes());
    out.extend_from_slice(group_id.as_bytes());
    out.extend_from_slice(call_id);
    out.extend_from_slice(&key_id.to_le_bytes());
    out.extend_from_slice(key);
    out
}

/// Signing payload for a sender-key distribution envelope.
pub fn distribution_sig_payload(group_id: &str, version: u32, iteration: u32, ck: &[u8; 32]) -> Vec<u8> {
    let mut out = DIST_SIG_TAG.to_vec();
    out.extend_from_slice(&(group_id.len() as u16).to_le_bytes());
    out.extend_from_slice(group_id.as_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&iteration.to_le_bytes());
    out.extend_from_slice(ck);
    out
}

// ── Group message wire format ────────────────────────────────────────────────

/// `string group_id ∥ string sender ∥ u32 version ∥ u32 iteration ∥
///  bytes cipher ∥ bytes signature` — the signature covers every byte
/// before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub group_id: String,
    pub sender: String,
    pub version: u32,
    pub iteration: u32,
    pub ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

impl GroupMessage {
    fn presig_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64 + self.ciphertext.len());
        wire::write_string(&self.group_id, &mut out)?;
        wire::write_string(&self.sender, &mut out)?;
        wire::write_u32(self.version, &mut out);
        wire::write_u32(self.iteration, &mut out);
        wire::write_bytes(&self.ciphertext, &mut out)?;
        Ok(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = self.presig_bytes()?;
        wire::write_bytes(&self.signature, &mut out)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(data);
        let group_id = r.read_string()?;
        let sender = r.read_string()?;
        let version = r.read_u32()?;
        let iteration = r.read_u32()?;
        let ciphertext = r.read_bytes()?;
        let signature = r.read_bytes()?;
        r.finish()?;
        Ok(Self {
            group_id,
            sender,
            version,
            iteration,
            ciphertext,
            signature,
        })
    }

    fn aad(&self) -> Vec<u8> {
        let mut ad = GROUP_MSG_AD_TAG.to_vec();
        ad.extend_from_slice(&(self.group_id.len() as u16).to_le_bytes());
        ad.extend_from_slice(self.group_id.as_bytes());
        ad.extend_from_slice(&(self.sender.len() as u16).to_le_bytes());
        ad.extend_from_slice(self.sender.as_bytes());
        ad.extend_from_slice(&self.version.to_le_bytes());
        ad.extend_from_slice(&self.iteration.to_le_bytes());
        ad
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// What `ensure_chain` decided about our sending chain.
pub struct ChainStatus {
    /// A fresh chain was created; distribute `(version, 0, chain_key)` to
    /// every current member and track acks.
    pub distribution: Option<DistributionMaterial>,
}

pub struct DistributionMaterial {
    pub version: u32,
    pub iteration: u32,
    pub chain_key: Zeroizing<[u8; 32]>,
}

#[derive(Default)]
pub struct GroupEngine {
    own: HashMap<String, SenderChain>,
    remote: HashMap<(String, String), RemoteSenderState>,
    pending: HashMap<String, PendingDistribution>,
    call_keys: HashMap<(String, [u8; 16]), CallKey>,
}

impl GroupEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Own chain lifecycle ──────────────────────────────────────────────

    /// Make sure a usable sending chain exists for `group_id`, rotating if
    /// any trigger fires. Members are the CURRENT group roster.
    pub fn ensure_chain(
        &mut self,
        group_id: &str,
        members: &[String],
        now: u64,
    ) -> Result<ChainStatus, E2eeError> {
        let rotate = match self.own.get(group_id) {
            None => true,
            Some(chain) => chain.needs_rotation(members, now),
        };
        if !rotate {
            return Ok(ChainStatus { distribution: None });
        }

        let next_version = self.own.get(group_id).map(|c| c.version + 1).unwrap_or(1);
        let mut ck = [0u8; 32];
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(&mut ck);

        debug!(group = group_id, version = next_version, "sender key rotated");
        self.own.insert(
            group_id.to_string(),
            SenderChain {
                group_id: group_id.to_string(),
                version: next_version,
                chain_key: ck,
                iteration: 0,
                members_hash: members_hash(members),
                created_at: now,
                sent_count: 0,
                dirty: false,
            },
        );
        // Any older unacknowledged distribution is superseded.
        self.pending.remove(group_id);
        Ok(ChainStatus {
            distribution: Some(DistributionMaterial {
                version: next_version,
                iteration: 0,
                chain_key: Zeroizing::new(ck),
            }),
        })
    }

    /// A membership event was observed; the next send must rotate.
    pub fn mark_dirty(&mut self, group_id: &str) {
        if let Some(chain) = self.own.get_mut(group_id) {
            chain.dirty = true;
        }
    }

    /// Current distribution material for a re-send to a late requester.
    pub fn distribution_for(&self, group_id: &str) -> Option<DistributionMaterial> {
        self.own.get(group_id).map(|c| DistributionMaterial {
            version: c.version,
            iteration: c.iteration,
            chain_key: Zeroizing::new(c.chain_key),
        })
    }

    /// Seal a padded envelope as a signed group message.
    pub fn seal_group_message(
        &mut self,
        group_id: &str,
        sender_identity: &identity::IdentityKeyset,
        sender: &str,
        padded_plaintext: &[u8],
    ) -> Result<Vec<u8>, E2eeError> {
        let chain = self
            .own
            .get_mut(group_id)
            .ok_or_else(|| E2eeError::SenderKeyStale {
                group: group_id.to_string(),
                want: 0,
            })?;
        let (next_ck, mk) = chain_step(&chain.chain_key)?;
        let iteration = chain.iteration;
        chain.chain_key.zeroize();
        chain.chain_key = next_ck;
        chain.iteration += 1;
        chain.sent_count += 1;

        let mut msg = GroupMessage {
            group_id: group_id.to_string(),
            sender: sender.to_string(),
            version: chain.version,
            iteration,
            ciphertext: Vec::new(),
            signature: Vec::new(),
        };
        msg.ciphertext = aead::seal_prefixed(&mk, &msg.aad(), padded_plaintext)?;
        msg.signature = sender_identity.sign(&msg.presig_bytes()?).to_vec();
        Ok(msg.encode()?)
    }

    // ── Remote chains ────────────────────────────────────────────────────

    /// Install a sender-key distribution received over the ratchet channel.
    /// Older versions than the stored one are ignored.
    pub fn accept_distribution(
        &mut self,
        group_id: &str,
        sender: &str,
        version: u32,
        iteration: u32,
        chain_key: &[u8; 32],
    ) -> Result<(), E2eeError> {
        let key = (group_id.to_string(), sender.to_string());
        if let Some(existing) = self.remote.get(&key) {
            if existing.version >= version {
                return Ok(());
            }
        }
        self.remote.insert(
            key,
            RemoteSenderState {
                version,
                chain_key: *chain_key,
                next_iteration: iteration,
                skipped: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Verify and open a group message. `sender_sign_public` must come from
    /// the KT-verified identity of the claimed sender.
    pub fn open_group_message(
        &mut self,
        data: &[u8],
        sender_sign_public: &[u8; 32],
    ) -> Result<(GroupMessage, Zeroizing<Vec<u8>>), E2eeError> {
        let msg = GroupMessage::decode(data)?;
        identity::verify_signature(sender_sign_public, &msg.presig_bytes()?, &msg.signature)
            .map_err(|_| E2eeError::AuthFailed)?;

        let key = (msg.group_id.clone(), msg.sender.clone());
        let state = self
            .remote
            .get_mut(&key)
            .filter(|s| s.version == msg.version)
            .ok_or_else(|| E2eeError::SenderKeyStale {
                group: msg.group_id.clone(),
                want: msg.version,
            })?;

        // Skipped-key cache first.
        if let Some(idx) = state
            .skipped
            .iter()
            .position(|s| s.iteration == msg.iteration)
        {
            let mut entry = state.skipped.remove(idx).expect("index valid");
            let mk = Zeroizing::new(entry.mk);
            entry.mk.zeroize();
            let plain = aead::open_prefixed(&mk, &msg.aad(), &msg.ciphertext)
                .map_err(|_| E2eeError::AuthFailed)?;
            return Ok((msg, plain));
        }

        if msg.iteration < state.next_iteration {
            // Key already consumed; a replay or a very old message.
            return Err(E2eeError::AuthFailed);
        }
        let gap = msg.iteration - state.next_iteration;
        if gap > GROUP_MAX_SKIP {
            return Err(E2eeError::SkipBudgetExceeded);
        }

        // Derive on a scratch copy; commit after authentication.
        let mut ck = state.chain_key;
        let mut new_skipped: Vec<SkippedGroupKey> = Vec::with_capacity(gap as usize);
        let mut iter = state.next_iteration;
        let mk = loop {
            let (next, mk) = chain_step(&ck)?;
            ck.zeroize();
            ck = next;
            if iter == msg.iteration {
                break mk;
            }
            new_skipped.push(SkippedGroupKey {
                iteration: iter,
                mk: *mk,
            });
            iter += 1;
        };

        let plain = aead::open_prefixed(&mk, &msg.aad(), &msg.ciphertext).map_err(|_| {
            for s in new_skipped.iter_mut() {
                s.mk.zeroize();
            }
            E2eeError::AuthFailed
        })?;

        state.chain_key.zeroize();
        state.chain_key = ck;
        state.next_iteration = msg.iteration + 1;
        state.skipped.extend(new_skipped);
        while state.skipped.len() > GROUP_MAX_STORED_SKIPPED {
            if let Some(mut old) = state.skipped.pop_front() {
                old.mk.zeroize();
            }
        }
        Ok((msg, plain))
    }

    // ── Distribution ack tracking ────────────────────────────────────────

    pub fn track_distribution(
        &mut self,
        group_id: &str,
        version: u32,
        members: &[String],
        own_username: &str,
        now: u64,
    ) {
        let outstanding: HashSet<String> = members
            .iter()
            .filter(|m| m.as_str() != own_username)
            .cloned()
            .collect();
        if outstanding.is_empty() {
            self.pending.remove(group_id);
            return;
        }
        self.pending.insert(
            group_id.to_string(),
            PendingDistribution {
                group_id: group_id.to_string(),
                version,
                outstanding,
                last_sent: now,
            },
        );
    }

    /// Ack from a member for the given version; clears them from the
    /// outstanding set.
    pub fn distribution_acked(&mut self, group_id: &str, member: &str) {
        let done = if let Some(pending) = self.pending.get_mut(group_id) {
            pending.outstanding.remove(member);
            pending.outstanding.is_empty()
        } else {
            false
        };
        if done {
            self.pending.remove(group_id);
        }
    }

    /// Drop a departed member from every outstanding set.
    pub fn member_left(&mut self, group_id: &str, member: &str) {
        self.distribution_acked(group_id, member);
        self.remote
            .remove(&(group_id.to_string(), member.to_string()));
    }

    pub fn pending_distributions_due(&mut self, now: u64) -> Vec<PendingDistribution> {
        let due: Vec<PendingDistribution> = self
            .pending
            .values()
            .filter(|p| p.due_for_resend(now))
            .cloned()
            .collect();
        for p in &due {
            if let Some(entry) = self.pending.get_mut(&p.group_id) {
                entry.last_sent = now;
            }
        }
        due
    }

    pub fn pending_distribution(&self, group_id: &str) -> Option<&PendingDistribution> {
        self.pending.get(group_id)
    }

    // ── Call keys ────────────────────────────────────────────────────────

    /// Install a media key; an older `key_id` than the stored one is
    /// ignored so re-ordered distributions cannot roll the key back.
    pub fn store_call_key(
        &mut self,
        group_id: &str,
        call_id: &[u8; 16],
        key_id: u32,
        key: [u8; 32],
    ) {
        let map_key = (group_id.to_string(), *call_id);
        match self.call_keys.get(&map_key) {
            Some(existing) if existing.key_id > key_id => {}
            _ => {
                self.call_keys.insert(map_key, CallKey { key_id, key });
            }
        }
    }

    pub fn call_key(&self, group_id: &str, call_id: &[u8; 16]) -> Option<&CallKey> {
        self.call_keys.get(&(group_id.to_string(), *call_id))
    }

    pub fn drop_call(&mut self, group_id: &str, call_id: &[u8; 16]) {
        self.call_keys.remove(&(group_id.to_string(), *call_id));
    }

    /// Wipe everything (logout).
    pub fn clear(&mut self) {
        self.own.clear();
        self.remote.clear();
        self.pending.clear();
        self.call_keys.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mi_crypto::identity::IdentityKeyset;

    fn members(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn members_hash_order_independent() {
        assert_eq!(
            members_hash(&members(&["a", "b", "c"])),
            members_hash(&members(&["c", "a", "b"]))
        );
        assert_ne!(
            members_hash(&members(&["a", "b"])),
            members_hash(&members(&["a", "b", "c"]))
        );
    }

    #[test]
    fn first_send_creates_chain_and_distribution() {
        let mut engine = GroupEngine::new();
        let status = engine
            .ensure_chain("g1", &members(&["a", "b", "c"]), 100)
            .unwrap();
        let dist = status.distribution.expect("fresh chain distributes");
        assert_eq!(dist.version, 1);
        assert_eq!(dist.iteration, 0);
        let again = engine
            .ensure_chain("g1", &members(&["a", "b", "c"]), 101)
            .unwrap();
        assert!(again.distribution.is_none());
    }

    #[test]
    fn membership_change_forces_rotation_to_new_roster_only() {
        let mut engine = GroupEngine::new();
        let roster = members(&["a", "b", "c"]);
        let dist = engine.ensure_chain("g1", &roster, 0).unwrap().distribution.unwrap();
        engine.track_distribution("g1", dist.version, &roster, "a", 0);
        // kick "c": dirty mark + roster change
        engine.mark_dirty("g1");
        engine.member_left("g1", "c");
        let new_roster = members(&["a", "b"]);
        let dist2 = engine
            .ensure_chain("g1", &new_roster, 1)
            .unwrap()
            .distribution
            .expect("rotation after kick");
        assert_eq!(dist2.version, 2);
        engine.track_distribution("g1", dist2.version, &new_roster, "a", 1);
        let pending = engine.pending_distribution("g1").unwrap();
        assert_eq!(pending.version, 2);
        assert!(!pending.outstanding.contains("c"));
        assert!(pending.outstanding.contains("b"));
    }

    #[test]
    fn count_and_age_triggers() {
        let mut engine = GroupEngine::new();
        let roster = members(&["a", "b"]);
        engine.ensure_chain("g", &roster, 0).unwrap();
        {
            let chain = engine.own.get_mut("g").unwrap();
            chain.sent_count = ROTATE_MAX_MESSAGES;
        }
        assert!(engine
            .ensure_chain("g", &roster, 1)
            .unwrap()
            .distribution
            .is_some());
        {
            let chain = engine.own.get_mut("g").unwrap();
            chain.created_at = 0;
        }
        assert!(engine
            .ensure_chain("g", &roster, ROTATE_MAX_AGE_SECS)
            .unwrap()
            .distribution
            .is_some());
    }

    #[test]
    fn group_message_roundtrip_with_signature() {
        let sender_id = IdentityKeyset::generate();
        let mut sender = GroupEngine::new();
        let roster = members(&["alice", "bob"]);
        let dist = sender
            .ensure_chain("g", &roster, 0)
            .unwrap()
            .distribution
            .unwrap();

        let mut receiver = GroupEngine::new();
        receiver
            .accept_distribution("g", "alice", dist.version, dist.iteration, &dist.chain_key)
            .unwrap();

        let wire = sender
            .seal_group_message("g", &sender_id, "alice", b"padded payload")
            .unwrap();
        let (msg, plain) = receiver
            .open_group_message(&wire, sender_id.sign_public())
            .unwrap();
        assert_eq!(msg.iteration, 0);
        assert_eq!(&plain[..], b"padded payload");

        // wrong signer key refused
        let other = IdentityKeyset::generate();
        let wire2 = sender
            .seal_group_message("g", &sender_id, "alice", b"again")
            .unwrap();
        assert!(receiver
            .open_group_message(&wire2, other.sign_public())
            .is_err());
    }

    #[test]
    fn out_of_order_group_messages_use_skipped_cache() {
        let sender_id = IdentityKeyset::generate();
        let mut sender = GroupEngine::new();
        let dist = sender
            .ensure_chain("g", &members(&["a", "b"]), 0)
            .unwrap()
            .distribution
            .unwrap();
        let mut receiver = GroupEngine::new();
        receiver
            .accept_distribution("g", "a", dist.version, 0, &dist.chain_key)
            .unwrap();

        let w0 = sender.seal_group_message("g", &sender_id, "a", b"m0").unwrap();
        let w1 = sender.seal_group_message("g", &sender_id, "a", b"m1").unwrap();
        let w2 = sender.seal_group_message("g", &sender_id, "a", b"m2").unwrap();

        let (_, p2) = receiver
            .open_group_message(&w2, sender_id.sign_public())
            .unwrap();
        assert_eq!(&p2[..], b"m2");
        let (_, p0) = receiver
            .open_group_message(&w0, sender_id.sign_public())
            .unwrap();
        assert_eq!(&p0[..], b"m0");
        let (_, p1) = receiver
            .open_group_message(&w1, sender_id.sign_public())
            .unwrap();
        assert_eq!(&p1[..], b"m1");

        // replay of a consumed iteration fails
        assert!(receiver
            .open_group_message(&w0, sender_id.sign_public())
            .is_err());
    }

    #[test]
    fn stale_version_asks_for_key() {
        let sender_id = IdentityKeyset::generate();
        let mut sender = GroupEngine::new();
        sender.ensure_chain("g", &members(&["a", "b"]), 0).unwrap();
        let wire = sender.seal_group_message("g", &sender_id, "a", b"x").unwrap();

        let mut receiver = GroupEngine::new();
        match receiver.open_group_message(&wire, sender_id.sign_public()) {
            Err(E2eeError::SenderKeyStale { group, want }) => {
                assert_eq!(group, "g");
                assert_eq!(want, 1);
            }
            other => panic!("expected stale-key error, got {other:?}"),
        }
    }

    #[test]
    fn distribution_ack_tracking() {
        let mut engine = GroupEngine::new();
        let roster = members(&["a", "b", "c"]);
        let dist = engine.ensure_chain("g", &roster, 0).unwrap().distribution.unwrap();
        engine.track_distribution("g", dist.version, &roster, "a", 0);
        assert!(engine.pending_distributions_due(10).len() == 1);
        engine.distribution_acked("g", "b");
        engine.distribution_acked("g", "c");
        assert!(engine.pending_distribution("g").is_none());
    }

    #[test]
    fn call_key_monotonicity() {
        let mut engine = GroupEngine::new();
        let call = [1u8; 16];
        engine.store_call_key("g", &call, 2, [2u8; 32]);
        engine.store_call_key("g", &call, 1, [1u8; 32]);
        assert_eq!(engine.call_key("g", &call).unwrap().key_id, 2);
        engine.store_call_key("g", &call, 2, [9u8; 32]);
        assert_eq!(engine.call_key("g", &call).unwrap().key(), &[9u8; 32]);
        engine.store_call_key("g", &call, 3, [3u8; 32]);
        assert_eq!(engine.call_key("g", &call).unwrap().key_id, 3);
    }

    #[test]
    fn chain_derivation_is_deterministic() {
        let ck0 = [5u8; 32];
        let (next_a, mk_a) = chain_step(&ck0).unwrap();
        let (next_b, mk_b) = chain_step(&ck0).unwrap();
        assert_eq!(next_a, next_b);
        assert_eq!(*mk_a, *mk_b);
        assert_ne!(*mk_a, next_a);
    }
}
