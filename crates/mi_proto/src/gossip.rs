//! Key-transparency gossip wrapper.
//!
//! Every outbound E2EE plaintext carries the sender's current KT snapshot so
//! the peer can cross-check the log:
//!
//!   `MIKTGSP1 ∥ u64 tree_size ∥ 32B root ∥ u32 len ∥ inner plaintext`

use crate::error::ProtoError;
use crate::wire::{self, Reader};

pub const GOSSIP_MAGIC: [u8; 8] = *b"MIKTGSP1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipHeader {
    pub tree_size: u64,
    pub root: [u8; 32],
}

pub fn wrap(header: &GossipHeader, plain: &[u8]) -> Result<Vec<u8>, ProtoError> {
    let mut out = Vec::with_capacity(GOSSIP_MAGIC.len() + 44 + plain.len());
    out.extend_from_slice(&GOSSIP_MAGIC);
    wire::write_u64(header.tree_size, &mut out);
    wire::write_arr32(&header.root, &mut out);
    wire::write_bytes(plain, &mut out)?;
    Ok(out)
}

pub fn unwrap(data: &[u8]) -> Result<(GossipHeader, Vec<u8>), ProtoError> {
    let mut r = Reader::new(data);
    r.expect_magic(&GOSSIP_MAGIC)?;
    let tree_size = r.read_u64()?;
    let root = r.read_arr32()?;
    let plain = r.read_bytes()?;
    r.finish()?;
    Ok((GossipHeader { tree_size, root }, plain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let header = GossipHeader {
            tree_size: 42,
            root: [9u8; 32],
        };
        let wrapped = wrap(&header, b"inner").unwrap();
        let (got, plain) = unwrap(&wrapped).unwrap();
        assert_eq!(got, header);
        assert_eq!(plain, b"inner");
    }

    #[test]
    fn rejects_bad_magic() {
        let header = GossipHeader {
            tree_size: 1,
            root: [0u8; 32],
        };
        let mut wrapped = wrap(&header, b"x").unwrap();
        wrapped[0] = b'X';
        assert!(unwrap(&wrapped).is_err());
    }
}
