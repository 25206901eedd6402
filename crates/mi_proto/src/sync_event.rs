//! Device-sync events.
//!
//! Every device of the same user pushes opaque ciphertexts to the relay and
//! pulls those addressed to its device id. The sealed outer layout is
//! `MISY ∥ ver=1 ∥ nonce(24) ∥ mac(16) ∥ cipher` under the 32-byte
//! device-sync key; the inner plaintext is a versioned tagged event.

use zeroize::Zeroizing;

use crate::error::ProtoError;
use crate::sealed;
use crate::wire::{self, Reader};

pub const SYNC_OUTER_MAGIC: [u8; 4] = *b"MISY";
const VER: u8 = 1;

/// Delivery receipt states mirrored between devices.
pub const DELIVERY_DELIVERED: u8 = 1;
pub const DELIVERY_READ: u8 = 2;

/// Group-notice kinds mirrored between devices.
pub const NOTICE_JOIN: u8 = 1;
pub const NOTICE_LEAVE: u8 = 2;
pub const NOTICE_KICK: u8 = 3;
pub const NOTICE_ROLE_SET: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub peer: String,
    /// Empty for private chats.
    pub group_id: String,
    pub outgoing: bool,
    pub timestamp: u64,
    /// Encoded chat envelope bytes.
    pub envelope: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The device-sync key is being replaced; sealed under the OLD key.
    RotateKey { new_key: [u8; 32] },
    /// A message echo (outgoing) or mirror (incoming) for sibling devices.
    Message {
        peer: String,
        group_id: String,
        outgoing: bool,
        timestamp: u64,
        envelope: Vec<u8>,
    },
    Delivery {
        peer: String,
        msg_id: [u8; 16],
        state: u8,
    },
    GroupNotice {
        group_id: String,
        kind: u8,
        member: String,
        actor: String,
        role: u8,
    },
    /// Primary → newly linked device: bounded recent history window.
    HistorySnapshot { entries: Vec<HistoryEntry> },
    /// Linked device asks the primary to send on the ratchet channel.
    SendPrivate { peer: String, envelope: Vec<u8> },
    SendGroup { group_id: String, envelope: Vec<u8> },
}

impl SyncEvent {
    fn type_byte(&self) -> u8 {
        match self {
            SyncEvent::RotateKey { .. } => 1,
            SyncEvent::Message { .. } => 2,
            SyncEvent::Delivery { .. } => 3,
            SyncEvent::GroupNotice { .. } => 4,
            SyncEvent::HistorySnapshot { .. } => 5,
            SyncEvent::SendPrivate { .. } => 6,
            SyncEvent::SendGroup { .. } => 7,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64);
        out.push(VER);
        out.push(self.type_byte());
        match self {
            SyncEvent::RotateKey { new_key } => wire::write_arr32(new_key, &mut out),
            SyncEvent::Message {
                peer,
                group_id,
                outgoing,
                timestamp,
                envelope,
            } => {
                wire::write_string(peer, &mut out)?;
                wire::write_string(group_id, &mut out)?;
                wire::write_u8(u8::from(*outgoing), &mut out);
                wire::write_u64(*timestamp, &mut out);
                wire::write_bytes(envelope, &mut out)?;
            }
            SyncEvent::Delivery {
                peer,
                msg_id,
                state,
            } => {
                wire::write_string(peer, &mut out)?;
                wire::write_id16(msg_id, &mut out);
                wire::write_u8(*state, &mut out);
            }
            SyncEvent::GroupNotice {
                group_id,
                kind,
                member,
                actor,
                role,
            } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_u8(*kind, &mut out);
                wire::write_string(member, &mut out)?;
                wire::write_string(actor, &mut out)?;
                wire::write_u8(*role, &mut out);
            }
            SyncEvent::HistorySnapshot { entries } => {
                wire::write_u32(entries.len() as u32, &mut out);
                for e in entries {
                    wire::write_string(&e.peer, &mut out)?;
                    wire::write_string(&e.group_id, &mut out)?;
                    wire::write_u8(u8::from(e.outgoing), &mut out);
                    wire::write_u64(e.timestamp, &mut out);
                    wire::write_bytes(&e.envelope, &mut out)?;
                }
            }
            SyncEvent::SendPrivate { peer, envelope } => {
                wire::write_string(peer, &mut out)?;
                wire::write_bytes(envelope, &mut out)?;
            }
            SyncEvent::SendGroup { group_id, envelope } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_bytes(envelope, &mut out)?;
            }
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(data);
        let ver = r.read_u8()?;
        if ver != VER {
            return Err(ProtoError::BadVersion(ver));
        }
        let tag = r.read_u8()?;
        let event = match tag {
            1 => SyncEvent::RotateKey {
                new_key: r.read_arr32()?,
            },
            2 => SyncEvent::Message {
                peer: r.read_string()?,
                group_id: r.read_string()?,
                outgoing: r.read_u8()? != 0,
                timestamp: r.read_u64()?,
                envelope: r.read_bytes()?,
            },
            3 => SyncEvent::Delivery {
                peer: r.read_string()?,
                msg_id: r.read_id16()?,
                state: r.read_u8()?,
            },
            4 => SyncEvent::GroupNotice {
                group_id: r.read_string()?,
                kind: r.read_u8()?,
                member: r.read_string()?,
                actor: r.read_string()?,
                role: r.read_u8()?,
            },
            5 => {
                let count = r.read_u32()? as usize;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    entries.push(HistoryEntry {
                        peer: r.read_string()?,
                        group_id: r.read_string()?,
                        outgoing: r.read_u8()? != 0,
                        timestamp: r.read_u64()?,
                        envelope: r.read_bytes()?,
                    });
                }
                SyncEvent::HistorySnapshot { entries }
            }
            6 => SyncEvent::SendPrivate {
                peer: r.read_string()?,
                envelope: r.read_bytes()?,
            },
            7 => SyncEvent::SendGroup {
                group_id: r.read_string()?,
                envelope: r.read_bytes()?,
            },
            other => return Err(ProtoError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(event)
    }
}

/// Seal an event under the device-sync key.
pub fn seal(key: &[u8; 32], event: &SyncEvent) -> Result<Vec<u8>, ProtoError> {
    sealed::seal(&SYNC_OUTER_MAGIC, key, &event.encode()?)
}

/// Open a device-sync ciphertext and decode the event.
pub fn open(key: &[u8; 32], data: &[u8]) -> Result<SyncEvent, ProtoError> {
    let plain: Zeroizing<Vec<u8>> = sealed::open(&SYNC_OUTER_MAGIC, key, data)?;
    SyncEvent::decode(&plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_events_roundtrip() {
        let events = vec![
            SyncEvent::RotateKey { new_key: [1u8; 32] },
            SyncEvent::Message {
                peer: "bob".into(),
                group_id: String::new(),
                outgoing: true,
                timestamp: 1000,
                envelope: vec![1, 2, 3],
            },
            SyncEvent::Delivery {
                peer: "bob".into(),
                msg_id: [2u8; 16],
                state: DELIVERY_READ,
            },
            SyncEvent::GroupNotice {
                group_id: "g".into(),
                kind: NOTICE_KICK,
                member: "carol".into(),
                actor: "alice".into(),
                role: 0,
            },
            SyncEvent::HistorySnapshot {
                entries: vec![HistoryEntry {
                    peer: "bob".into(),
                    group_id: String::new(),
                    outgoing: false,
                    timestamp: 99,
                    envelope: vec![9],
                }],
            },
            SyncEvent::SendPrivate {
                peer: "bob".into(),
                envelope: vec![4, 5],
            },
            SyncEvent::SendGroup {
                group_id: "g".into(),
                envelope: vec![6],
            },
        ];
        for event in events {
            let decoded = SyncEvent::decode(&event.encode().unwrap()).unwrap();
            assert_eq!(decoded, event);
        }
    }

    #[test]
    fn seal_open_under_correct_key_only() {
        let key = [5u8; 32];
        let event = SyncEvent::RotateKey { new_key: [9u8; 32] };
        let cipher = seal(&key, &event).unwrap();
        assert_eq!(open(&key, &cipher).unwrap(), event);
        assert!(open(&[6u8; 32], &cipher).is_err());
    }
}
