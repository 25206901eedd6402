//! Typed chat envelope — the innermost plaintext between ratcheted peers.
//!
//! Layout: `MICH ∥ ver=1 ∥ type:u8 ∥ msg_id[16] ∥ type-specific body`.
//! The envelope is gossip-wrapped, padded, and only then AEAD-sealed, so
//! nothing here is visible to the relay.

use crate::error::ProtoError;
use crate::wire::{self, Reader};

pub const CHAT_MAGIC: [u8; 4] = *b"MICH";
pub const CHAT_VERSION: u8 = 1;

/// Rich-message flag: a 16-byte reply-to id follows the flags byte.
pub const RICH_FLAG_REPLY: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEnvelope {
    pub msg_id: [u8; 16],
    pub body: ChatBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatBody {
    Text {
        text: String,
    },
    Ack,
    File {
        size: u64,
        name: String,
        file_id: String,
        key: [u8; 32],
    },
    GroupText {
        group_id: String,
        text: String,
    },
    GroupInvite {
        group_id: String,
    },
    GroupFile {
        group_id: String,
        size: u64,
        name: String,
        file_id: String,
        key: [u8; 32],
    },
    SenderKeyDist {
        group_id: String,
        version: u32,
        iteration: u32,
        chain_key: [u8; 32],
        signature: Vec<u8>,
    },
    SenderKeyReq {
        group_id: String,
        want_version: u32,
    },
    Rich {
        kind: u8,
        flags: u8,
        reply_to: Option<[u8; 16]>,
        body: Vec<u8>,
    },
    ReadReceipt,
    Typing {
        on: bool,
    },
    Sticker {
        sticker_id: String,
    },
    Presence {
        online: bool,
    },
    GroupCallKeyDist {
        group_id: String,
        call_id: [u8; 16],
        key_id: u32,
        key: [u8; 32],
        signature: Vec<u8>,
    },
    GroupCallKeyReq {
        group_id: String,
        call_id: [u8; 16],
        want_key_id: u32,
    },
}

impl ChatBody {
    pub fn type_byte(&self) -> u8 {
        match self {
            ChatBody::Text { .. } => 1,
            ChatBody::Ack => 2,
            ChatBody::File { .. } => 3,
            ChatBody::GroupText { .. } => 4,
            ChatBody::GroupInvite { .. } => 5,
            ChatBody::GroupFile { .. } => 6,
            ChatBody::SenderKeyDist { .. } => 7,
            ChatBody::SenderKeyReq { .. } => 8,
            ChatBody::Rich { .. } => 9,
            ChatBody::ReadReceipt => 10,
            ChatBody::Typing { .. } => 11,
            ChatBody::Sticker { .. } => 12,
            ChatBody::Presence { .. } => 13,
            ChatBody::GroupCallKeyDist { .. } => 14,
            ChatBody::GroupCallKeyReq { .. } => 15,
        }
    }
}

impl ChatEnvelope {
    pub fn new(msg_id: [u8; 16], body: ChatBody) -> Self {
        Self { msg_id, body }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&CHAT_MAGIC);
        out.push(CHAT_VERSION);
        out.push(self.body.type_byte());
        wire::write_id16(&self.msg_id, &mut out);
        match &self.body {
            ChatBody::Text { text } => wire::write_string(text, &mut out)?,
            ChatBody::Ack | ChatBody::ReadReceipt => {}
            ChatBody::File {
                size,
                name,
                file_id,
                key,
            } => {
                wire::write_u64(*size, &mut out);
                wire::write_string(name, &mut out)?;
                wire::write_string(file_id, &mut out)?;
                wire::write_arr32(key, &mut out);
            }
            ChatBody::GroupText { group_id, text } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_string(text, &mut out)?;
            }
            ChatBody::GroupInvite { group_id } => wire::write_string(group_id, &mut out)?,
            ChatBody::GroupFile {
                group_id,
                size,
                name,
                file_id,
                key,
            } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_u64(*size, &mut out);
                wire::write_string(name, &mut out)?;
                wire::write_string(file_id, &mut out)?;
                wire::write_arr32(key, &mut out);
            }
            ChatBody::SenderKeyDist {
                group_id,
                version,
                iteration,
                chain_key,
                signature,
            } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_u32(*version, &mut out);
                wire::write_u32(*iteration, &mut out);
                wire::write_arr32(chain_key, &mut out);
                wire::write_bytes(signature, &mut out)?;
            }
            ChatBody::SenderKeyReq {
                group_id,
                want_version,
            } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_u32(*want_version, &mut out);
            }
            ChatBody::Rich {
                kind,
                flags,
                reply_to,
                body,
            } => {
                wire::write_u8(*kind, &mut out);
                let mut f = *flags & !RICH_FLAG_REPLY;
                if reply_to.is_some() {
                    f |= RICH_FLAG_REPLY;
                }
                wire::write_u8(f, &mut out);
                if let Some(reply) = reply_to {
                    wire::write_id16(reply, &mut out);
                }
                wire::write_bytes(body, &mut out)?;
            }
            ChatBody::Typing { on } => wire::write_u8(u8::from(*on), &mut out),
            ChatBody::Sticker { sticker_id } => wire::write_string(sticker_id, &mut out)?,
            ChatBody::Presence { online } => wire::write_u8(u8::from(*online), &mut out),
            ChatBody::GroupCallKeyDist {
                group_id,
                call_id,
                key_id,
                key,
                signature,
            } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_id16(call_id, &mut out);
                wire::write_u32(*key_id, &mut out);
                wire::write_arr32(key, &mut out);
                wire::write_bytes(signature, &mut out)?;
            }
            ChatBody::GroupCallKeyReq {
                group_id,
                call_id,
                want_key_id,
            } => {
                wire::write_string(group_id, &mut out)?;
                wire::write_id16(call_id, &mut out);
                wire::write_u32(*want_key_id, &mut out);
            }
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(data);
        r.expect_magic(&CHAT_MAGIC)?;
        let ver = r.read_u8()?;
        if ver != CHAT_VERSION {
            return Err(ProtoError::BadVersion(ver));
        }
        let tag = r.read_u8()?;
        let msg_id = r.read_id16()?;
        let body = match tag {
            1 => ChatBody::Text {
                text: r.read_string()?,
            },
            2 => ChatBody::Ack,
            3 => ChatBody::File {
                size: r.read_u64()?,
                name: r.read_string()?,
                file_id: r.read_string()?,
                key: r.read_arr32()?,
            },
            4 => ChatBody::GroupText {
                group_id: r.read_string()?,
                text: r.read_string()?,
            },
            5 => ChatBody::GroupInvite {
                group_id: r.read_string()?,
            },
            6 => ChatBody::GroupFile {
                group_id: r.read_string()?,
                size: r.read_u64()?,
                name: r.read_string()?,
                file_id: r.read_string()?,
                key: r.read_arr32()?,
            },
            7 => ChatBody::SenderKeyDist {
                group_id: r.read_string()?,
                version: r.read_u32()?,
                iteration: r.read_u32()?,
                chain_key: r.read_arr32()?,
                signature: r.read_bytes()?,
            },
            8 => ChatBody::SenderKeyReq {
                group_id: r.read_string()?,
                want_version: r.read_u32()?,
            },
            9 => {
                let kind = r.read_u8()?;
                let flags = r.read_u8()?;
                let reply_to = if flags & RICH_FLAG_REPLY != 0 {
                    Some(r.read_id16()?)
                } else {
                    None
                };
                ChatBody::Rich {
                    kind,
                    flags,
                    reply_to,
                    body: r.read_bytes()?,
                }
            }
            10 => ChatBody::ReadReceipt,
            11 => ChatBody::Typing {
                on: r.read_u8()? != 0,
            },
            12 => ChatBody::Sticker {
                sticker_id: r.read_string()?,
            },
            13 => ChatBody::Presence {
                online: r.read_u8()? != 0,
            },
            14 => ChatBody::GroupCallKeyDist {
                group_id: r.read_string()?,
                call_id: r.read_id16()?,
                key_id: r.read_u32()?,
                key: r.read_arr32()?,
                signature: r.read_bytes()?,
            },
            15 => ChatBody::GroupCallKeyReq {
                group_id: r.read_string()?,
                call_id: r.read_id16()?,
                want_key_id: r.read_u32()?,
            },
            other => return Err(ProtoError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(Self { msg_id, body })
    }
}
