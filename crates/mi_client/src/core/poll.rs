//! `poll_chat`: one sweep over every inbound channel.
//!
//! Order matters and is fixed:
//!   1. opportunistic cover-traffic heartbeat
//!   2. re-send pending sender-key distributions past their cool-down
//!   3. drain device-sync ciphertexts (both roles)
//!   4. on the primary, consume SendPrivate/SendGroup requests from
//!      siblings by actually sending on the E2EE channels
//!   5. drain pairwise messages (dedupe, dispatch, ack, sibling fan-out)
//!   6. drain sender-key group messages (signature, chain, decrypt)
//!   7. drain group notices (membership changes dirty the sender key)
//!
//! Anything that fails authentication is dropped silently; transport
//! failures abort the sweep and surface to the caller.

use std::time::Instant;

use tracing::debug;

use mi_e2ee::group::{self, GroupMessage};
use mi_proto::envelope::{ChatBody, ChatEnvelope};
use mi_proto::frame::FrameType;
use mi_proto::gossip::{self, GossipHeader};
use mi_proto::padding;
use mi_proto::sync_event::{self, SyncEvent, NOTICE_KICK, NOTICE_LEAVE};
use mi_proto::wire::{self, Reader};
use mi_sync::key::DeviceSyncKey;

use mi_kt::GossipOutcome;

use crate::core::{now_unix, parse_blob_list, random_id16, ClientCore};
use crate::error::ClientError;
use crate::events::{ChatEvent, ChatPollResult};

impl ClientCore {
    pub fn poll_chat(&mut self) -> Result<ChatPollResult, ClientError> {
        if self.channel.is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        let mut result = ChatPollResult::default();

        // 1. cover traffic
        if self.cover.due(Instant::now()) {
            if let Err(e) = self.heartbeat() {
                debug!(error = %e, "cover heartbeat skipped");
            }
        }

        // 2. distribution re-sends
        self.resend_due_distributions();

        // 3 + 4. device sync
        self.poll_device_sync(&mut result)?;

        // 5. pairwise
        self.poll_pairwise(&mut result)?;

        // 6. sender-key groups
        self.poll_group(&mut result)?;

        // 7. group notices
        self.poll_notices(&mut result)?;

        if self.kt.alert() {
            result.diagnostics.push("kt gossip alert".into());
        }
        if let Err(e) = self.persist_sessions() {
            result.diagnostics.push(format!("state persist failed: {e}"));
        }
        Ok(result)
    }

    fn resend_due_distributions(&mut self) {
        let due = self.groups.pending_distributions_due(now_unix());
        for pending in due {
            let Some(dist) = self.groups.distribution_for(&pending.group_id) else {
                continue;
            };
            if dist.version != pending.version {
                continue;
            }
            let outstanding: Vec<String> = pending.outstanding.iter().cloned().collect();
            let signature = self
                .identity
                .sign(&group::distribution_sig_payload(
                    &pending.group_id,
                    dist.version,
                    dist.iteration,
                    &dist.chain_key,
                ))
                .to_vec();
            for member in outstanding {
                let msg_id = random_id16();
                let envelope = ChatEnvelope::new(
                    msg_id,
                    ChatBody::SenderKeyDist {
                        group_id: pending.group_id.clone(),
                        version: dist.version,
                        iteration: dist.iteration,
                        chain_key: *dist.chain_key,
                        signature: signature.clone(),
                    },
                );
                match self.send_envelope_private(&member, &envelope) {
                    Ok(()) => {
                        self.distribution_msg_ids
                            .insert(msg_id, pending.group_id.clone());
                    }
                    Err(e) => debug!(member = %member, error = %e, "distribution re-send failed"),
                }
            }
        }
    }

    // ── Device sync ──────────────────────────────────────────────────────

    fn poll_device_sync(&mut self, result: &mut ChatPollResult) -> Result<(), ClientError> {
        if !self.config.device_sync_enabled || self.sync_key.is_none() {
            return Ok(());
        }
        let mut payload = Vec::new();
        wire::write_string(&self.device_id, &mut payload)?;
        let response = self.process_encrypted(FrameType::DeviceSyncPull, &payload)?;
        let ciphertexts = parse_blob_list(&response)?;

        for cipher in ciphertexts {
            // Re-read the key each round: a RotateKey event switches it
            // mid-drain for everything that follows.
            let Some(key) = &self.sync_key else { break };
            let event = match sync_event::open(key.as_bytes(), &cipher) {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "device sync ciphertext dropped");
                    continue;
                }
            };
            self.apply_sync_event(event, result);
        }
        Ok(())
    }

    fn apply_sync_event(&mut self, event: SyncEvent, result: &mut ChatPollResult) {
        match event {
            SyncEvent::RotateKey { new_key } => {
                let Ok(next) = DeviceSyncKey::from_bytes(&new_key) else {
                    debug!("rotate-key event with invalid key dropped");
                    return;
                };
                if self.store.store_device_sync_key(&next).is_err() {
                    result.diagnostics.push("sync key rotation not persisted".into());
                }
                match &mut self.sync_key {
                    Some(key) => key.rotate_to(next),
                    None => self.sync_key = Some(next),
                }
                debug!("device sync key rotated by sibling");
            }
            SyncEvent::Message {
                peer,
                group_id,
                outgoing,
                timestamp,
                envelope,
            } => result.events.push(ChatEvent::MessageMirror {
                peer,
                group_id,
                outgoing,
                timestamp,
                envelope,
            }),
            SyncEvent::Delivery { peer, msg_id, state } => {
                result.events.push(ChatEvent::DeliveryMirror { peer, msg_id, state })
            }
            SyncEvent::GroupNotice {
                group_id,
                kind,
                member,
                actor,
                role,
            } => {
                self.groups.mark_dirty(&group_id);
                if kind == NOTICE_LEAVE || kind == NOTICE_KICK {
                    self.groups.member_left(&group_id, &member);
                }
                result.events.push(ChatEvent::GroupNotice {
                    group_id,
                    kind,
                    member,
                    actor,
                    role,
                });
            }
            SyncEvent::HistorySnapshot { entries } => {
                let count = entries.len();
                for entry in entries {
                    result.events.push(ChatEvent::MessageMirror {
                        peer: entry.peer,
                        group_id: entry.group_id,
                        outgoing: entry.outgoing,
                        timestamp: entry.timestamp,
                        envelope: entry.envelope,
                    });
                }
                result.events.push(ChatEvent::HistoryRestored { entries: count });
            }
            SyncEvent::SendPrivate { peer, envelope } => {
                if !self.config.device_sync_primary {
                    return;
                }
                let Ok(envelope) = ChatEnvelope::decode(&envelope) else {
                    debug!("send-private request with bad envelope dropped");
                    return;
                };
                match self.send_envelope_private(&peer, &envelope) {
                    Ok(()) => {
                        let echo = envelope.encode().unwrap_or_default();
                        self.sync_push_best_effort(&SyncEvent::Message {
                            peer,
                            group_id: String::new(),
                            outgoing: true,
                            timestamp: now_unix(),
                            envelope: echo,
                        });
                    }
                    Err(e) => debug!(error = %e, "sibling private send failed"),
                }
            }
            SyncEvent::SendGroup { group_id, envelope } => {
                if !self.config.device_sync_primary {
                    return;
                }
                let Ok(envelope) = ChatEnvelope::decode(&envelope) else {
                    debug!("send-group request with bad envelope dropped");
                    return;
                };
                match self.send_group_envelope(&group_id, &envelope) {
                    Ok(()) => {
                        let echo = envelope.encode().unwrap_or_default();
                        self.sync_push_best_effort(&SyncEvent::Message {
                            peer: String::new(),
                            group_id,
                            outgoing: true,
                            timestamp: now_unix(),
                            envelope: echo,
                        });
                    }
                    Err(e) => debug!(error = %e, "sibling group send failed"),
                }
            }
        }
    }

    // ── Pairwise ─────────────────────────────────────────────────────────

    fn poll_pairwise(&mut self, result: &mut ChatPollResult) -> Result<(), ClientError> {
        let response = self.process_encrypted(FrameType::PullE2ee, &[])?;
        let messages = parse_blob_list(&response)?;

        for blob in messages {
            let (sender, plain) =
                match self
                    .pairwise
                    .open_message(&self.identity, &mut self.prekeys, &blob)
                {
                    Ok(opened) => opened,
                    Err(e) => {
                        debug!(error = %e, "inbound pairwise message dropped");
                        continue;
                    }
                };
            let Ok(wrapped) = padding::unpad(&plain) else {
                debug!("inbound message with bad padding dropped");
                continue;
            };
            let Ok((gossip_header, inner)) = gossip::unwrap(&wrapped) else {
                debug!("inbound message with bad gossip wrapper dropped");
                continue;
            };
            self.handle_gossip(&gossip_header);
            let Ok(envelope) = ChatEnvelope::decode(&inner) else {
                debug!("inbound message with bad envelope dropped");
                continue;
            };
            if !self.dedup.insert(&sender, &envelope.msg_id) {
                continue;
            }
            self.dispatch_envelope(sender, envelope, result);
        }
        Ok(())
    }

    fn handle_gossip(&mut self, header: &GossipHeader) {
        if header.tree_size == 0 {
            // Peer had no snapshot yet; nothing to compare.
            return;
        }
        match self.kt.observe_gossip(header) {
            GossipOutcome::Consistent | GossipOutcome::PeerBehind | GossipOutcome::Mismatch => {}
            GossipOutcome::NeedProof { from_size, to_size } => {
                match self.fetch_kt_consistency(from_size, to_size) {
                    Ok(proof) => {
                        if self.kt.apply_gossip_proof(header, &proof).is_ok() {
                            if let Some(snapshot) = self.kt.snapshot().copied() {
                                if let Err(e) = self.store.store_kt_snapshot(&snapshot) {
                                    debug!(error = %e, "kt snapshot persist failed");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "kt consistency fetch failed");
                        self.kt.record_mismatch();
                    }
                }
            }
        }
    }

    fn dispatch_envelope(
        &mut self,
        sender: String,
        envelope: ChatEnvelope,
        result: &mut ChatPollResult,
    ) {
        let msg_id = envelope.msg_id;
        let mut ack = false;
        let mut mirror = false;

        match envelope.body.clone() {
            ChatBody::Text { text } => {
                result.events.push(ChatEvent::Text {
                    from: sender.clone(),
                    group_id: String::new(),
                    msg_id,
                    text,
                });
                ack = true;
                mirror = true;
            }
            ChatBody::Ack => {
                if let Some(group_id) = self.distribution_msg_ids.remove(&msg_id) {
                    self.groups.distribution_acked(&group_id, &sender);
                } else {
                    result.events.push(ChatEvent::Delivered {
                        from: sender.clone(),
                        msg_id,
                    });
                }
            }
            ChatBody::File {
                size,
                name,
                file_id,
                key,
            } => {
                result.events.push(ChatEvent::File {
                    from: sender.clone(),
                    group_id: String::new(),
                    msg_id,
                    size,
                    name,
                    file_id,
                    key,
                });
                ack = true;
                mirror = true;
            }
            ChatBody::GroupText { group_id, text } => {
                result.events.push(ChatEvent::Text {
                    from: sender.clone(),
                    group_id,
                    msg_id,
                    text,
                });
                ack = true;
                mirror = true;
            }
            ChatBody::GroupInvite { group_id } => {
                result.events.push(ChatEvent::GroupInvite {
                    from: sender.clone(),
                    group_id,
                });
                ack = true;
            }
            ChatBody::GroupFile {
                group_id,
                size,
                name,
                file_id,
                key,
            } => {
                result.events.push(ChatEvent::File {
                    from: sender.clone(),
                    group_id,
                    msg_id,
                    size,
                    name,
                    file_id,
                    key,
                });
                ack = true;
                mirror = true;
            }
            ChatBody::SenderKeyDist {
                group_id,
                version,
                iteration,
                chain_key,
                signature,
            } => {
                if self.verify_peer_signature(
                    &sender,
                    &group::distribution_sig_payload(&group_id, version, iteration, &chain_key),
                    &signature,
                ) {
                    if self
                        .groups
                        .accept_distribution(&group_id, &sender, version, iteration, &chain_key)
                        .is_ok()
                    {
                        ack = true;
                    }
                } else {
                    debug!(sender = %sender, "sender key distribution with bad signature dropped");
                }
            }
            ChatBody::SenderKeyReq {
                group_id,
                want_version,
            } => {
                self.answer_sender_key_request(&sender, &group_id, want_version);
            }
            ChatBody::Rich {
                kind,
                flags,
                reply_to,
                body,
            } => {
                result.events.push(ChatEvent::Rich {
                    from: sender.clone(),
                    msg_id,
                    kind,
                    flags,
                    reply_to,
                    body,
                });
                ack = true;
                mirror = true;
            }
            ChatBody::ReadReceipt => {
                result.events.push(ChatEvent::ReadReceipt {
                    from: sender.clone(),
                    msg_id,
                });
            }
            ChatBody::Typing { on } => {
                result.events.push(ChatEvent::Typing {
                    from: sender.clone(),
                    on,
                });
            }
            ChatBody::Sticker { sticker_id } => {
                result.events.push(ChatEvent::Sticker {
                    from: sender.clone(),
                    msg_id,
                    sticker_id,
                });
                ack = true;
                mirror = true;
            }
            ChatBody::Presence { online } => {
                result.events.push(ChatEvent::Presence {
                    from: sender.clone(),
                    online,
                });
            }
            ChatBody::GroupCallKeyDist {
                group_id,
                call_id,
                key_id,
                key,
                signature,
            } => {
                if self.verify_peer_signature(
                    &sender,
                    &group::call_key_sig_payload(&group_id, &call_id, key_id, &key),
                    &signature,
                ) {
                    self.groups.store_call_key(&group_id, &call_id, key_id, key);
                    result.events.push(ChatEvent::GroupCallKey {
                        group_id,
                        call_id,
                        key_id,
                    });
                } else {
                    debug!(sender = %sender, "call key distribution with bad signature dropped");
                }
            }
            ChatBody::GroupCallKeyReq {
                group_id,
                call_id,
                want_key_id,
            } => {
                self.answer_call_key_request(&sender, &group_id, &call_id, want_key_id);
            }
        }

        if ack {
            let ack_envelope = ChatEnvelope::new(msg_id, ChatBody::Ack);
            if let Err(e) = self.send_envelope_private(&sender, &ack_envelope) {
                debug!(error = %e, "ack send failed");
            }
        }
        if mirror {
            if let Ok(bytes) = envelope.encode() {
                self.sync_push_best_effort(&SyncEvent::Message {
                    peer: sender,
                    group_id: String::new(),
                    outgoing: false,
                    timestamp: now_unix(),
                    envelope: bytes,
                });
            }
        }
    }

    /// Verify a signature against the sender's KT-verified identity.
    fn verify_peer_signature(&mut self, sender: &str, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(identity) = self.peer_identity(sender) else {
            return false;
        };
        mi_crypto::identity::verify_signature(&identity.sign_public, payload, signature).is_ok()
    }

    /// Re-send the current distribution to one verified requester.
    fn answer_sender_key_request(&mut self, requester: &str, group_id: &str, want_version: u32) {
        let members = match self.list_group_members(group_id) {
            Ok(members) => members,
            Err(e) => {
                debug!(error = %e, "member check for key request failed");
                return;
            }
        };
        if !members.iter().any(|m| m.username == requester) {
            debug!(requester = %requester, "sender key request from non-member dropped");
            return;
        }
        let Some(dist) = self.groups.distribution_for(group_id) else {
            return;
        };
        if dist.version < want_version {
            return;
        }
        let signature = self
            .identity
            .sign(&group::distribution_sig_payload(
                group_id,
                dist.version,
                dist.iteration,
                &dist.chain_key,
            ))
            .to_vec();
        let msg_id = random_id16();
        let envelope = ChatEnvelope::new(
            msg_id,
            ChatBody::SenderKeyDist {
                group_id: group_id.to_string(),
                version: dist.version,
                iteration: dist.iteration,
                chain_key: *dist.chain_key,
                signature,
            },
        );
        match self.send_envelope_private(requester, &envelope) {
            Ok(()) => {
                self.distribution_msg_ids
                    .insert(msg_id, group_id.to_string());
            }
            Err(e) => debug!(error = %e, "sender key answer failed"),
        }
    }

    fn answer_call_key_request(
        &mut self,
        requester: &str,
        group_id: &str,
        call_id: &[u8; 16],
        want_key_id: u32,
    ) {
        let Some((key_id, key)) = self
            .groups
            .call_key(group_id, call_id)
            .map(|k| (k.key_id, *k.key()))
        else {
            return;
        };
        if key_id < want_key_id {
            return;
        }
        let signature = self
            .identity
            .sign(&group::call_key_sig_payload(group_id, call_id, key_id, &key))
            .to_vec();
        let envelope = ChatEnvelope::new(
            random_id16(),
            ChatBody::GroupCallKeyDist {
                group_id: group_id.to_string(),
                call_id: *call_id,
                key_id,
                key,
                signature,
            },
        );
        if let Err(e) = self.send_envelope_private(requester, &envelope) {
            debug!(error = %e, "call key answer failed");
        }
    }

    // ── Sender-key groups ────────────────────────────────────────────────

    fn poll_group(&mut self, result: &mut ChatPollResult) -> Result<(), ClientError> {
        let response = self.process_encrypted(FrameType::PullGroupE2ee, &[])?;
        let messages = parse_blob_list(&response)?;

        for blob in messages {
            let Ok(preview) = GroupMessage::decode(&blob) else {
                debug!("group message with bad framing dropped");
                continue;
            };
            let sender = preview.sender.clone();
            let Ok(identity) = self.peer_identity(&sender) else {
                debug!(sender = %sender, "group message from unknown identity dropped");
                continue;
            };
            match self.groups.open_group_message(&blob, &identity.sign_public) {
                Ok((msg, plain)) => {
                    let Ok(wrapped) = padding::unpad(&plain) else {
                        continue;
                    };
                    let Ok((gossip_header, inner)) = gossip::unwrap(&wrapped) else {
                        continue;
                    };
                    self.handle_gossip(&gossip_header);
                    let Ok(envelope) = ChatEnvelope::decode(&inner) else {
                        continue;
                    };
                    if !self.dedup.insert(&msg.sender, &envelope.msg_id) {
                        continue;
                    }
                    self.dispatch_envelope(msg.sender, envelope, result);
                }
                Err(mi_e2ee::E2eeError::SenderKeyStale { group, want }) => {
                    let envelope = ChatEnvelope::new(
                        random_id16(),
                        ChatBody::SenderKeyReq {
                            group_id: group.clone(),
                            want_version: want,
                        },
                    );
                    if let Err(e) = self.send_envelope_private(&sender, &envelope) {
                        debug!(error = %e, "sender key request failed");
                    }
                }
                Err(e) => {
                    debug!(error = %e, "group message dropped");
                }
            }
        }
        Ok(())
    }

    // ── Group notices ────────────────────────────────────────────────────

    fn poll_notices(&mut self, result: &mut ChatPollResult) -> Result<(), ClientError> {
        let response = self.process_encrypted(FrameType::PullGroupNotices, &[])?;
        let mut r = Reader::new(&response);
        let count = r.read_u32()? as usize;
        let mut notices = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            notices.push((
                r.read_string()?,
                r.read_u8()?,
                r.read_string()?,
                r.read_string()?,
                r.read_u8()?,
            ));
        }
        r.finish()?;

        for (group_id, kind, member, actor, role) in notices {
            self.groups.mark_dirty(&group_id);
            if kind == NOTICE_LEAVE || kind == NOTICE_KICK {
                self.groups.member_left(&group_id, &member);
            }
            self.sync_push_best_effort(&SyncEvent::GroupNotice {
                group_id: group_id.clone(),
                kind,
                member: member.clone(),
                actor: actor.clone(),
                role,
            });
            result.events.push(ChatEvent::GroupNotice {
                group_id,
                kind,
                member,
                actor,
                role,
            });
        }
        Ok(())
    }
}
