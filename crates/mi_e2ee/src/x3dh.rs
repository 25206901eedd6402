//! Hybrid X3DH session initiation.
//!
//! Four X25519 outputs plus an ML-KEM-768 shared secret feed HKDF:
//!
//!   DH1 = DH(IK_A, SPK_B)   — mutual authentication
//!   DH2 = DH(EK_A, IK_B)    — forward secrecy
//!   DH3 = DH(EK_A, SPK_B)   — replay protection
//!   DH4 = DH(EK_A, OPK_B)   — one-time forward secrecy [optional]
//!   SS  = KEM.encap(KEMPK_B) — post-quantum leg
//!
//!   RK = HKDF(salt=0*32, ikm = 0xFF*32 ∥ DH1..DH4 ∥ SS, info="mi_e2ee_x3dh_v1")
//!
//! Non-negotiable: the SPK(+KEM) signature is verified before any DH is
//! computed, and the responder replays the exact same concatenation order.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use mi_crypto::identity::IdentityKeyset;
use mi_crypto::kem::{self, KemCiphertext, KemSecretKey};
use mi_crypto::kdf;
use mi_proto::wire::{self, Reader};
use mi_proto::ProtoError;

use crate::error::E2eeError;
use crate::prekeys::PreKeyBundle;

const X3DH_INFO: &[u8] = b"mi_e2ee_x3dh_v1";

/// Sent alongside the first ciphertext so the responder can derive the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitHeader {
    pub initiator: String,
    pub ik_sign_public: [u8; 32],
    pub ik_dh_public: [u8; 32],
    pub ephemeral_public: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_id: Option<u32>,
    pub kem_ciphertext: Vec<u8>,
}

impl InitHeader {
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(128 + self.kem_ciphertext.len());
        wire::write_string(&self.initiator, &mut out)?;
        wire::write_arr32(&self.ik_sign_public, &mut out);
        wire::write_arr32(&self.ik_dh_public, &mut out);
        wire::write_arr32(&self.ephemeral_public, &mut out);
        wire::write_u32(self.signed_prekey_id, &mut out);
        match self.one_time_id {
            Some(id) => {
                wire::write_u8(1, &mut out);
                wire::write_u32(id, &mut out);
            }
            None => wire::write_u8(0, &mut out),
        }
        wire::write_bytes(&self.kem_ciphertext, &mut out)?;
        Ok(out)
    }

    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        let initiator = r.read_string()?;
        let ik_sign_public = r.read_arr32()?;
        let ik_dh_public = r.read_arr32()?;
        let ephemeral_public = r.read_arr32()?;
        let signed_prekey_id = r.read_u32()?;
        let one_time_id = if r.read_u8()? != 0 {
            Some(r.read_u32()?)
        } else {
            None
        };
        let kem_ciphertext = r.read_bytes()?;
        Ok(Self {
            initiator,
            ik_sign_public,
            ik_dh_public,
            ephemeral_public,
            signed_prekey_id,
            one_time_id,
            kem_ciphertext,
        })
    }
}

pub struct InitiationOutcome {
    pub root_key: Zeroizing<[u8; 32]>,
    pub header: InitHeader,
}

/// Initiator side: derive the root key from a verified bundle.
pub fn initiate(
    my_username: &str,
    my_identity: &IdentityKeyset,
    bundle: &PreKeyBundle,
) -> Result<InitiationOutcome, E2eeError> {
    bundle.verify()?;

    let spk = X25519Public::from(bundle.signed_prekey);
    let peer_ik_dh = X25519Public::from(bundle.dh_public);

    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral).to_bytes();

    let dh1 = my_identity.dh_secret().diffie_hellman(&spk);
    let dh2 = ephemeral.diffie_hellman(&peer_ik_dh);
    let dh3 = ephemeral.diffie_hellman(&spk);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = bundle.one_time {
        let dh4 = ephemeral.diffie_hellman(&X25519Public::from(opk));
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let kem_public = mi_crypto::kem::KemPublicKey::from_bytes(&bundle.kem_public)?;
    let (mut kem_ss, kem_ct) = kem::encapsulate(&kem_public)?;
    ikm.extend_from_slice(&kem_ss);
    kem_ss.zeroize();

    let root_key = derive_root(&ikm)?;
    ikm.zeroize();

    Ok(InitiationOutcome {
        root_key,
        header: InitHeader {
            initiator: my_username.to_string(),
            ik_sign_public: *my_identity.sign_public(),
            ik_dh_public: *my_identity.dh_public(),
            ephemeral_public,
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_id: bundle.one_time_id,
            kem_ciphertext: kem_ct.as_bytes().to_vec(),
        },
    })
}

/// Responder side: replay the initiator's derivation.
pub fn respond(
    my_identity: &IdentityKeyset,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    my_kem_secret: &KemSecretKey,
    header: &InitHeader,
) -> Result<Zeroizing<[u8; 32]>, E2eeError> {
    let initiator_ik_dh = X25519Public::from(header.ik_dh_public);
    let ephemeral = X25519Public::from(header.ephemeral_public);

    // Mirror the initiator's order exactly (DH is commutative per pair).
    let dh1 = my_spk_secret.diffie_hellman(&initiator_ik_dh);
    let dh2 = my_identity.dh_secret().diffie_hellman(&ephemeral);
    let dh3 = my_spk_secret.diffie_hellman(&ephemeral);

    let mut ikm = vec![0xFFu8; 32];
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = my_opk_secret {
        let dh4 = opk.diffie_hellman(&ephemeral);
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let kem_ct = KemCiphertext::from_bytes(&header.kem_ciphertext)?;
    let mut kem_ss = kem::decapsulate(&kem_ct, my_kem_secret)?;
    ikm.extend_from_slice(&kem_ss);
    kem_ss.zeroize();

    let root_key = derive_root(&ikm)?;
    ikm.zeroize();
    Ok(root_key)
}

fn derive_root(ikm: &[u8]) -> Result<Zeroizing<[u8; 32]>, E2eeError> {
    let mut root = Zeroizing::new([0u8; 32]);
    kdf::hkdf_expand(ikm, Some(&[0u8; 32]), X3DH_INFO, root.as_mut())?;
    Ok(root)
}
