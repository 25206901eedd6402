//! Key-transparency proof extension.
//!
//! Appended to every prekey-fetch response:
//!
//!   `u32 kt_version=1 ∥ u64 tree_size ∥ 32B root ∥ u64 leaf_index ∥
//!    u32 audit_count ∥ 32B * audit_count ∥ u32 cons_count ∥
//!    32B * cons_count ∥ bytes sth_sig`

use crate::error::ProtoError;
use crate::wire::{self, Reader};

pub const KT_WIRE_VERSION: u32 = 1;

/// A 64-level path bounds any tree a u64 size can describe.
const MAX_PROOF_NODES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KtProofBundle {
    pub tree_size: u64,
    pub root: [u8; 32],
    pub leaf_index: u64,
    pub audit_path: Vec<[u8; 32]>,
    pub consistency: Vec<[u8; 32]>,
    pub sth_sig: Vec<u8>,
}

impl KtProofBundle {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64 + 32 * (self.audit_path.len() + self.consistency.len()));
        wire::write_u32(KT_WIRE_VERSION, &mut out);
        wire::write_u64(self.tree_size, &mut out);
        wire::write_arr32(&self.root, &mut out);
        wire::write_u64(self.leaf_index, &mut out);
        wire::write_u32(self.audit_path.len() as u32, &mut out);
        for node in &self.audit_path {
            wire::write_arr32(node, &mut out);
        }
        wire::write_u32(self.consistency.len() as u32, &mut out);
        for node in &self.consistency {
            wire::write_arr32(node, &mut out);
        }
        wire::write_bytes(&self.sth_sig, &mut out)?;
        Ok(out)
    }

    /// Decode from a reader positioned at the extension; callers with a
    /// standalone buffer use [`KtProofBundle::decode`].
    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        let ver = r.read_u32()?;
        if ver != KT_WIRE_VERSION {
            return Err(ProtoError::BadVersion(ver as u8));
        }
        let tree_size = r.read_u64()?;
        let root = r.read_arr32()?;
        let leaf_index = r.read_u64()?;
        let audit_count = r.read_u32()? as usize;
        if audit_count > MAX_PROOF_NODES {
            return Err(ProtoError::FieldTooLong("audit path"));
        }
        let mut audit_path = Vec::with_capacity(audit_count);
        for _ in 0..audit_count {
            audit_path.push(r.read_arr32()?);
        }
        let cons_count = r.read_u32()? as usize;
        if cons_count > MAX_PROOF_NODES {
            return Err(ProtoError::FieldTooLong("consistency proof"));
        }
        let mut consistency = Vec::with_capacity(cons_count);
        for _ in 0..cons_count {
            consistency.push(r.read_arr32()?);
        }
        let sth_sig = r.read_bytes()?;
        Ok(Self {
            tree_size,
            root,
            leaf_index,
            audit_path,
            consistency,
            sth_sig,
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(data);
        let bundle = Self::read_from(&mut r)?;
        r.finish()?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let bundle = KtProofBundle {
            tree_size: 10,
            root: [1u8; 32],
            leaf_index: 3,
            audit_path: vec![[2u8; 32], [3u8; 32]],
            consistency: vec![[4u8; 32]],
            sth_sig: vec![9; 64],
        };
        let decoded = KtProofBundle::decode(&bundle.encode().unwrap()).unwrap();
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn rejects_oversized_path() {
        let bundle = KtProofBundle {
            tree_size: 10,
            root: [1u8; 32],
            leaf_index: 3,
            audit_path: vec![[2u8; 32]; 65],
            consistency: vec![],
            sth_sig: vec![],
        };
        assert!(KtProofBundle::decode(&bundle.encode().unwrap()).is_err());
    }
}
