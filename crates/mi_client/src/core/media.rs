//! Group calls and media relay.
//!
//! Media frames are sealed under a per-call 32-byte key distributed over
//! the pairwise ratchet channel (`GroupCallKeyDist`). `key_id` is monotonic
//! per call; whoever rotates picks `stored + 1` and redistributes. The
//! relay only ever sees opaque ciphertext.

use rand::RngCore;
use tracing::debug;

use mi_crypto::aead;
use mi_e2ee::group;
use mi_proto::envelope::{ChatBody, ChatEnvelope};
use mi_proto::frame::FrameType;
use mi_proto::wire::{self, Reader};

use crate::core::{random_id16, ClientCore};
use crate::error::ClientError;

const MEDIA_AD_TAG: &[u8] = b"mi_e2ee_media_v1";

pub const CALL_EVENT_JOINED: u8 = 1;
pub const CALL_EVENT_LEFT: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCallEvent {
    pub kind: u8,
    pub member: String,
}

fn media_ad(call_id: &[u8; 16]) -> Vec<u8> {
    let mut ad = MEDIA_AD_TAG.to_vec();
    ad.extend_from_slice(call_id);
    ad
}

impl ClientCore {
    /// Start a call in a group: the relay allocates the call id, we mint
    /// the first media key and hand it to every current member.
    pub fn start_group_call(&mut self, group_id: &str) -> Result<[u8; 16], ClientError> {
        if group_id.is_empty() {
            return Err(ClientError::InvalidInput("group id empty".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        let response = self.process_encrypted(FrameType::StartGroupCall, &payload)?;
        let mut r = Reader::new(&response);
        let call_id = r.read_id16()?;
        r.finish()?;

        self.rotate_group_call_key(group_id, &call_id)?;
        Ok(call_id)
    }

    pub fn join_group_call(&mut self, group_id: &str, call_id: &[u8; 16]) -> Result<(), ClientError> {
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_id16(call_id, &mut payload);
        self.process_encrypted(FrameType::JoinGroupCall, &payload)?;
        Ok(())
    }

    pub fn leave_group_call(&mut self, group_id: &str, call_id: &[u8; 16]) -> Result<(), ClientError> {
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_id16(call_id, &mut payload);
        self.process_encrypted(FrameType::LeaveGroupCall, &payload)?;
        self.groups.drop_call(group_id, call_id);
        Ok(())
    }

    /// Mint the next media key (`stored_key_id + 1`), install it locally,
    /// and distribute it to every current member over the ratchet channel.
    pub fn rotate_group_call_key(
        &mut self,
        group_id: &str,
        call_id: &[u8; 16],
    ) -> Result<u32, ClientError> {
        let next_key_id = self
            .groups
            .call_key(group_id, call_id)
            .map(|k| k.key_id + 1)
            .unwrap_or(1);
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        self.groups.store_call_key(group_id, call_id, next_key_id, key);

        let signature = self
            .identity
            .sign(&group::call_key_sig_payload(group_id, call_id, next_key_id, &key))
            .to_vec();
        let members = self.list_group_members(group_id)?;
        for member in members {
            if member.username == self.username {
                continue;
            }
            let envelope = ChatEnvelope::new(
                random_id16(),
                ChatBody::GroupCallKeyDist {
                    group_id: group_id.to_string(),
                    call_id: *call_id,
                    key_id: next_key_id,
                    key,
                    signature: signature.clone(),
                },
            );
            if let Err(e) = self.send_envelope_private(&member.username, &envelope) {
                debug!(member = %member.username, error = %e, "call key distribution failed");
            }
        }
        Ok(next_key_id)
    }

    /// Ask current members for the call key (joining late, or after our key
    /// stopped decrypting because someone rotated).
    pub fn request_group_call_key(
        &mut self,
        group_id: &str,
        call_id: &[u8; 16],
    ) -> Result<(), ClientError> {
        let want_key_id = self
            .groups
            .call_key(group_id, call_id)
            .map(|k| k.key_id + 1)
            .unwrap_or(1);
        let members = self.list_group_members(group_id)?;
        for member in members {
            if member.username == self.username {
                continue;
            }
            let envelope = ChatEnvelope::new(
                random_id16(),
                ChatBody::GroupCallKeyReq {
                    group_id: group_id.to_string(),
                    call_id: *call_id,
                    want_key_id,
                },
            );
            if let Err(e) = self.send_envelope_private(&member.username, &envelope) {
                debug!(member = %member.username, error = %e, "call key request failed");
            }
        }
        Ok(())
    }

    fn seal_media(
        &self,
        group_id: &str,
        call_id: &[u8; 16],
        media: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let key = self
            .groups
            .call_key(group_id, call_id)
            .ok_or_else(|| ClientError::InvalidInput("no media key for this call".into()))?;
        Ok(aead::seal_prefixed(key.key(), &media_ad(call_id), media)?)
    }

    fn open_media(&self, group_id: &str, call_id: &[u8; 16], cipher: &[u8]) -> Option<Vec<u8>> {
        let key = self.groups.call_key(group_id, call_id)?;
        aead::open_prefixed(key.key(), &media_ad(call_id), cipher)
            .ok()
            .map(|p| p.to_vec())
    }

    // ── Direct (1:1) media ───────────────────────────────────────────────

    /// Start a direct call: we mint the call id and the key, and hand both
    /// to the peer (`GroupCallKeyDist` with an empty group id).
    pub fn start_direct_call(&mut self, peer: &str) -> Result<[u8; 16], ClientError> {
        if peer.is_empty() {
            return Err(ClientError::InvalidInput("peer empty".into()));
        }
        let call_id = random_id16();
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        self.groups.store_call_key("", &call_id, 1, key);

        let signature = self
            .identity
            .sign(&group::call_key_sig_payload("", &call_id, 1, &key))
            .to_vec();
        let envelope = ChatEnvelope::new(
            random_id16(),
            ChatBody::GroupCallKeyDist {
                group_id: String::new(),
                call_id,
                key_id: 1,
                key,
                signature,
            },
        );
        self.send_envelope_private(peer, &envelope)?;
        Ok(call_id)
    }

    pub fn push_media(
        &mut self,
        peer: &str,
        call_id: &[u8; 16],
        media: &[u8],
    ) -> Result<(), ClientError> {
        let cipher = self.seal_media("", call_id, media)?;
        let mut payload = Vec::new();
        wire::write_string(peer, &mut payload)?;
        wire::write_id16(call_id, &mut payload);
        wire::write_bytes(&cipher, &mut payload)?;
        self.process_encrypted(FrameType::PushMedia, &payload)?;
        Ok(())
    }

    pub fn pull_media(&mut self, call_id: &[u8; 16]) -> Result<Vec<Vec<u8>>, ClientError> {
        let mut payload = Vec::new();
        wire::write_id16(call_id, &mut payload);
        let response = self.process_encrypted(FrameType::PullMedia, &payload)?;
        let frames = super::parse_blob_list(&response)?;
        Ok(frames
            .iter()
            .filter_map(|cipher| self.open_media("", call_id, cipher))
            .collect())
    }

    // ── Group media ──────────────────────────────────────────────────────

    pub fn push_group_media(
        &mut self,
        group_id: &str,
        call_id: &[u8; 16],
        media: &[u8],
    ) -> Result<(), ClientError> {
        let cipher = self.seal_media(group_id, call_id, media)?;
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_id16(call_id, &mut payload);
        wire::write_bytes(&cipher, &mut payload)?;
        self.process_encrypted(FrameType::PushGroupMedia, &payload)?;
        Ok(())
    }

    /// Pull and decrypt pending media; frames that fail authentication
    /// (rotated key not yet received, tampering) are dropped.
    pub fn pull_group_media(
        &mut self,
        group_id: &str,
        call_id: &[u8; 16],
    ) -> Result<Vec<(String, Vec<u8>)>, ClientError> {
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_id16(call_id, &mut payload);
        let response = self.process_encrypted(FrameType::PullGroupMedia, &payload)?;

        let mut r = Reader::new(&response);
        let count = r.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let sender = r.read_string()?;
            let cipher = r.read_bytes()?;
            if let Some(media) = self.open_media(group_id, call_id, &cipher) {
                out.push((sender, media));
            }
        }
        r.finish()?;
        Ok(out)
    }

    pub fn pull_group_call_events(
        &mut self,
        group_id: &str,
        call_id: &[u8; 16],
    ) -> Result<Vec<GroupCallEvent>, ClientError> {
        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_id16(call_id, &mut payload);
        let response = self.process_encrypted(FrameType::PullGroupCallEvents, &payload)?;
        let mut r = Reader::new(&response);
        let count = r.read_u32()? as usize;
        let mut events = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            events.push(GroupCallEvent {
                kind: r.read_u8()?,
                member: r.read_string()?,
            });
        }
        r.finish()?;
        Ok(events)
    }
}
