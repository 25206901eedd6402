//! Outbound chat: private and group sends.
//!
//! Every plaintext follows the same path: typed envelope → gossip wrap →
//! bucket padding → ratchet (or sender-key) seal → relay. Resends reuse the
//! original message id so receivers dedupe instead of duplicating.

use tracing::debug;

use mi_proto::envelope::{ChatBody, ChatEnvelope};
use mi_proto::frame::FrameType;
use mi_proto::gossip::{self, GossipHeader};
use mi_proto::padding;
use mi_proto::sync_event::SyncEvent;
use mi_proto::wire;

use mi_e2ee::group;

use crate::core::{now_unix, random_id16, ClientCore};
use crate::error::ClientError;

/// Rich-body kinds carried as `ChatBody::Rich`.
pub const RICH_KIND_LOCATION: u8 = 1;
pub const RICH_KIND_CONTACT_CARD: u8 = 2;

impl ClientCore {
    fn gossip_header(&self) -> GossipHeader {
        self.kt.gossip_header().unwrap_or(GossipHeader {
            tree_size: 0,
            root: [0u8; 32],
        })
    }

    /// envelope → gossip wrap → pad; the bytes the ratchet seals.
    pub(crate) fn prepare_plaintext(&self, envelope: &ChatEnvelope) -> Result<Vec<u8>, ClientError> {
        let inner = envelope.encode()?;
        let wrapped = gossip::wrap(&self.gossip_header(), &inner)?;
        Ok(padding::pad(&wrapped))
    }

    /// Seal and send one envelope to a peer over the pairwise channel.
    pub(crate) fn send_envelope_private(
        &mut self,
        peer: &str,
        envelope: &ChatEnvelope,
    ) -> Result<(), ClientError> {
        if peer.is_empty() {
            return Err(ClientError::InvalidInput("peer empty".into()));
        }
        self.ensure_prekeys_published()?;

        if !self.pairwise.has_session(peer) {
            let bundle = self.fetch_prekey_bundle(peer)?;
            self.pairwise.start_outbound(&self.identity, &bundle)?;
            self.persist_sessions()?;
        }
        let identity = self.peer_identity(peer)?;
        let fingerprint =
            mi_crypto::identity::fingerprint(&identity.sign_public, &identity.dh_public);

        let padded = self.prepare_plaintext(envelope)?;
        let sealed = self.pairwise.seal_message(peer, &fingerprint, &padded)?;

        let mut payload = Vec::new();
        wire::write_string(peer, &mut payload)?;
        wire::write_bytes(&sealed, &mut payload)?;
        self.process_encrypted(FrameType::SendE2ee, &payload)?;
        self.persist_sessions()?;
        Ok(())
    }

    pub(crate) fn persist_sessions(&mut self) -> Result<(), ClientError> {
        let sessions: Vec<_> = self.pairwise.sessions().cloned().collect();
        self.store.store_sessions(&sessions)?;
        self.store.store_prekeys(&self.prekeys)
    }

    fn mirror_private(&mut self, peer: &str, envelope: &ChatEnvelope) {
        let Ok(bytes) = envelope.encode() else { return };
        self.sync_push_best_effort(&SyncEvent::Message {
            peer: peer.to_string(),
            group_id: String::new(),
            outgoing: true,
            timestamp: now_unix(),
            envelope: bytes,
        });
    }

    fn mirror_group(&mut self, group_id: &str, envelope: &ChatEnvelope) {
        let Ok(bytes) = envelope.encode() else { return };
        self.sync_push_best_effort(&SyncEvent::Message {
            peer: String::new(),
            group_id: group_id.to_string(),
            outgoing: true,
            timestamp: now_unix(),
            envelope: bytes,
        });
    }

    // ── Private sends ────────────────────────────────────────────────────

    pub fn send_chat_text(&mut self, peer: &str, text: &str) -> Result<[u8; 16], ClientError> {
        self.resend_chat_text(peer, random_id16(), text)
    }

    /// Same message id as the original send; the receiver's dedup set makes
    /// the retry invisible if the first copy did arrive.
    pub fn resend_chat_text(
        &mut self,
        peer: &str,
        msg_id: [u8; 16],
        text: &str,
    ) -> Result<[u8; 16], ClientError> {
        if text.is_empty() {
            return Err(ClientError::InvalidInput("text empty".into()));
        }
        let envelope = ChatEnvelope::new(
            msg_id,
            ChatBody::Text {
                text: text.to_string(),
            },
        );
        self.send_envelope_private(peer, &envelope)?;
        self.mirror_private(peer, &envelope);
        Ok(msg_id)
    }

    pub fn send_chat_file(
        &mut self,
        peer: &str,
        size: u64,
        name: &str,
        file_id: &str,
        key: [u8; 32],
    ) -> Result<[u8; 16], ClientError> {
        self.resend_chat_file(peer, random_id16(), size, name, file_id, key)
    }

    pub fn resend_chat_file(
        &mut self,
        peer: &str,
        msg_id: [u8; 16],
        size: u64,
        name: &str,
        file_id: &str,
        key: [u8; 32],
    ) -> Result<[u8; 16], ClientError> {
        if name.is_empty() || file_id.is_empty() {
            return Err(ClientError::InvalidInput("file name or id empty".into()));
        }
        let envelope = ChatEnvelope::new(
            msg_id,
            ChatBody::File {
                size,
                name: name.to_string(),
                file_id: file_id.to_string(),
                key,
            },
        );
        self.send_envelope_private(peer, &envelope)?;
        self.mirror_private(peer, &envelope);
        Ok(msg_id)
    }

    pub fn send_chat_sticker(&mut self, peer: &str, sticker_id: &str) -> Result<[u8; 16], ClientError> {
        if sticker_id.is_empty() {
            return Err(ClientError::InvalidInput("sticker id empty".into()));
        }
        let envelope = ChatEnvelope::new(
            random_id16(),
            ChatBody::Sticker {
                sticker_id: sticker_id.to_string(),
            },
        );
        self.send_envelope_private(peer, &envelope)?;
        self.mirror_private(peer, &envelope);
        Ok(envelope.msg_id)
    }

    pub fn send_chat_rich(
        &mut self,
        peer: &str,
        kind: u8,
        flags: u8,
        reply_to: Option<[u8; 16]>,
        body: Vec<u8>,
    ) -> Result<[u8; 16], ClientError> {
        self.resend_chat_rich(peer, random_id16(), kind, flags, reply_to, body)
    }

    pub fn resend_chat_rich(
        &mut self,
        peer: &str,
        msg_id: [u8; 16],
        kind: u8,
        flags: u8,
        reply_to: Option<[u8; 16]>,
        body: Vec<u8>,
    ) -> Result<[u8; 16], ClientError> {
        let envelope = ChatEnvelope::new(
            msg_id,
            ChatBody::Rich {
                kind,
                flags,
                reply_to,
                body,
            },
        );
        self.send_envelope_private(peer, &envelope)?;
        self.mirror_private(peer, &envelope);
        Ok(msg_id)
    }

    pub fn send_chat_location(
        &mut self,
        peer: &str,
        latitude: f64,
        longitude: f64,
    ) -> Result<[u8; 16], ClientError> {
        let body = format!("{latitude},{longitude}").into_bytes();
        self.send_chat_rich(peer, RICH_KIND_LOCATION, 0, None, body)
    }

    pub fn send_chat_contact_card(
        &mut self,
        peer: &str,
        card: &str,
    ) -> Result<[u8; 16], ClientError> {
        if card.is_empty() {
            return Err(ClientError::InvalidInput("contact card empty".into()));
        }
        self.send_chat_rich(peer, RICH_KIND_CONTACT_CARD, 0, None, card.as_bytes().to_vec())
    }

    /// Read receipt for `msg_id` (the envelope's own id IS the reference).
    pub fn send_chat_read_receipt(
        &mut self,
        peer: &str,
        msg_id: [u8; 16],
    ) -> Result<(), ClientError> {
        let envelope = ChatEnvelope::new(msg_id, ChatBody::ReadReceipt);
        self.send_envelope_private(peer, &envelope)?;
        self.sync_push_best_effort(&SyncEvent::Delivery {
            peer: peer.to_string(),
            msg_id,
            state: mi_proto::sync_event::DELIVERY_READ,
        });
        Ok(())
    }

    pub fn send_chat_typing(&mut self, peer: &str, on: bool) -> Result<(), ClientError> {
        let envelope = ChatEnvelope::new(random_id16(), ChatBody::Typing { on });
        self.send_envelope_private(peer, &envelope)
    }

    pub fn send_chat_presence(&mut self, peer: &str, online: bool) -> Result<(), ClientError> {
        let envelope = ChatEnvelope::new(random_id16(), ChatBody::Presence { online });
        self.send_envelope_private(peer, &envelope)
    }

    pub fn send_group_invite(&mut self, peer: &str, group_id: &str) -> Result<(), ClientError> {
        if group_id.is_empty() {
            return Err(ClientError::InvalidInput("group id empty".into()));
        }
        let envelope = ChatEnvelope::new(
            random_id16(),
            ChatBody::GroupInvite {
                group_id: group_id.to_string(),
            },
        );
        self.send_envelope_private(peer, &envelope)
    }

    // ── Group sends ──────────────────────────────────────────────────────

    /// Rotate-if-needed, distribute the sender key, then seal and send.
    pub(crate) fn send_group_envelope(
        &mut self,
        group_id: &str,
        envelope: &ChatEnvelope,
    ) -> Result<(), ClientError> {
        if group_id.is_empty() {
            return Err(ClientError::InvalidInput("group id empty".into()));
        }
        let members: Vec<String> = self
            .list_group_members(group_id)?
            .into_iter()
            .map(|m| m.username)
            .collect();

        let now = now_unix();
        let status = self.groups.ensure_chain(group_id, &members, now)?;
        if let Some(dist) = status.distribution {
            self.distribute_sender_key(
                group_id,
                dist.version,
                dist.iteration,
                &dist.chain_key,
                &members,
                now,
            )?;
        }

        let padded = self.prepare_plaintext(envelope)?;
        let sealed =
            self.groups
                .seal_group_message(group_id, &self.identity, &self.username, &padded)?;

        let mut payload = Vec::new();
        wire::write_string(group_id, &mut payload)?;
        wire::write_bytes(&sealed, &mut payload)?;
        self.process_encrypted(FrameType::SendGroupE2ee, &payload)?;
        Ok(())
    }

    /// Send the distribution envelope to every member over the pairwise
    /// channel and start tracking acks.
    pub(crate) fn distribute_sender_key(
        &mut self,
        group_id: &str,
        version: u32,
        iteration: u32,
        chain_key: &[u8; 32],
        members: &[String],
        now: u64,
    ) -> Result<(), ClientError> {
        let signature = self
            .identity
            .sign(&group::distribution_sig_payload(group_id, version, iteration, chain_key))
            .to_vec();

        for member in members {
            if member == &self.username {
                continue;
            }
            let msg_id = random_id16();
            let envelope = ChatEnvelope::new(
                msg_id,
                ChatBody::SenderKeyDist {
                    group_id: group_id.to_string(),
                    version,
                    iteration,
                    chain_key: *chain_key,
                    signature: signature.clone(),
                },
            );
            match self.send_envelope_private(member, &envelope) {
                Ok(()) => {
                    self.distribution_msg_ids
                        .insert(msg_id, group_id.to_string());
                }
                Err(e) => {
                    // Stays in the outstanding set; the cool-down re-send
                    // in poll_chat retries.
                    debug!(member = %member, error = %e, "sender key distribution deferred");
                }
            }
        }
        self.groups
            .track_distribution(group_id, version, members, &self.username, now);
        Ok(())
    }

    pub fn send_group_chat_text(
        &mut self,
        group_id: &str,
        text: &str,
    ) -> Result<[u8; 16], ClientError> {
        if text.is_empty() {
            return Err(ClientError::InvalidInput("text empty".into()));
        }
        let envelope = ChatEnvelope::new(
            random_id16(),
            ChatBody::GroupText {
                group_id: group_id.to_string(),
                text: text.to_string(),
            },
        );
        self.send_group_envelope(group_id, &envelope)?;
        self.mirror_group(group_id, &envelope);
        Ok(envelope.msg_id)
    }

    pub fn send_group_chat_file(
        &mut self,
        group_id: &str,
        size: u64,
        name: &str,
        file_id: &str,
        key: [u8; 32],
    ) -> Result<[u8; 16], ClientError> {
        if name.is_empty() || file_id.is_empty() {
            return Err(ClientError::InvalidInput("file name or id empty".into()));
        }
        let envelope = ChatEnvelope::new(
            random_id16(),
            ChatBody::GroupFile {
                group_id: group_id.to_string(),
                size,
                name: name.to_string(),
                file_id: file_id.to_string(),
                key,
            },
        );
        self.send_group_envelope(group_id, &envelope)?;
        self.mirror_group(group_id, &envelope);
        Ok(envelope.msg_id)
    }
}
