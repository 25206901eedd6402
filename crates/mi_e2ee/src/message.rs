//! Pairwise E2EE wire format.
//!
//! What the relay stores and forwards for a private message:
//!
//!   `string sender ∥ u8 has_init ∥ [bytes init_header] ∥
//!    ratchet_header(48) ∥ bytes cipher`
//!
//! `cipher` is `nonce(24) ∥ mac(16) ∥ ct` over the padded, gossip-wrapped
//! chat envelope; the AEAD AD binds the sender name and the ratchet header
//! so neither can be swapped in transit.

use mi_proto::wire::{self, Reader};
use mi_proto::ProtoError;

use crate::ratchet::RatchetHeader;

const MSG_AD_TAG: &[u8] = b"mi_e2ee_msg_v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct E2eeMessage {
    pub sender: String,
    /// Encoded [`crate::x3dh::InitHeader`]; present until the responder has
    /// the session.
    pub init: Option<Vec<u8>>,
    pub header: RatchetHeader,
    pub ciphertext: Vec<u8>,
}

impl E2eeMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64 + self.ciphertext.len());
        wire::write_string(&self.sender, &mut out)?;
        match &self.init {
            Some(init) => {
                wire::write_u8(1, &mut out);
                wire::write_bytes(init, &mut out)?;
            }
            None => wire::write_u8(0, &mut out),
        }
        out.extend_from_slice(&self.header.encode());
        wire::write_bytes(&self.ciphertext, &mut out)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(data);
        let sender = r.read_string()?;
        let init = if r.read_u8()? != 0 {
            Some(r.read_bytes()?)
        } else {
            None
        };
        let header = RatchetHeader::read_from(&mut r)?;
        let ciphertext = r.read_bytes()?;
        r.finish()?;
        Ok(Self {
            sender,
            init,
            header,
            ciphertext,
        })
    }

    /// AEAD associated data for this message.
    pub fn aad(sender: &str, header: &RatchetHeader) -> Vec<u8> {
        let mut ad = MSG_AD_TAG.to_vec();
        ad.extend_from_slice(sender.as_bytes());
        ad.extend_from_slice(&header.encode());
        ad
    }
}
