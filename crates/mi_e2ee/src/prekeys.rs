//! Prekey material.
//!
//! - Signed prekey (SPK): X25519, rotated on a configurable cadence, public
//!   half signed together with the KEM public key by the identity signing
//!   key (one signature covers both, so neither can be swapped alone).
//! - One-time prekeys (OPK): X25519, consumed once per inbound session init.
//! - KEM keypair: ML-KEM-768, long-lived alongside the SPK.
//!
//! After a rotation the `published` flag drops so the next send republishes.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use mi_crypto::identity::{self, IdentityKeyset};
use mi_crypto::kem::{self, KemPublicKey, KemSecretKey};
use mi_proto::wire::{self, Reader};
use mi_proto::ProtoError;

use crate::error::E2eeError;

const SPK_SIG_TAG: &[u8] = b"mi_e2ee_spk_v1";

pub const DEFAULT_ONE_TIME_BATCH: usize = 32;

#[derive(Serialize, Deserialize)]
pub struct SignedPreKey {
    pub id: u32,
    secret: [u8; 32],
    pub public: [u8; 32],
    pub signature: Vec<u8>,
    pub created_at: u64,
}

impl SignedPreKey {
    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

impl Drop for SignedPreKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

#[derive(Serialize, Deserialize)]
pub struct OneTimePreKey {
    pub id: u32,
    secret: [u8; 32],
    pub public: [u8; 32],
}

impl OneTimePreKey {
    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret)
    }
}

impl Drop for OneTimePreKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// The local device's complete prekey state.
#[derive(Serialize, Deserialize)]
pub struct PreKeyStore {
    pub signed: SignedPreKey,
    /// Kept for a grace period so in-flight inits still decrypt.
    pub previous_signed: Option<SignedPreKey>,
    pub one_time: Vec<OneTimePreKey>,
    kem_public: Vec<u8>,
    kem_secret: Vec<u8>,
    next_id: u32,
    pub published: bool,
}

impl PreKeyStore {
    pub fn generate(identity: &IdentityKeyset, now: u64) -> Self {
        let (kem_public, kem_secret) = kem::keypair();
        let mut store = Self {
            signed: SignedPreKey {
                id: 0,
                secret: [0u8; 32],
                public: [0u8; 32],
                signature: Vec::new(),
                created_at: now,
            },
            previous_signed: None,
            one_time: Vec::new(),
            kem_public: kem_public.as_bytes().to_vec(),
            kem_secret: kem_secret.as_bytes().to_vec(),
            next_id: 1,
            published: false,
        };
        store.signed = store.fresh_signed(identity, now);
        store.refill_one_time(DEFAULT_ONE_TIME_BATCH);
        store
    }

    fn fresh_signed(&mut self, identity: &IdentityKeyset, now: u64) -> SignedPreKey {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        let signature = identity.sign(&spk_sig_payload(&public, &self.kem_public)).to_vec();
        let id = self.next_id;
        self.next_id += 1;
        SignedPreKey {
            id,
            secret: secret.to_bytes(),
            public,
            signature,
            created_at: now,
        }
    }

    /// Rotate the signed prekey; the old one stays for backlog decryption.
    pub fn rotate_signed(&mut self, identity: &IdentityKeyset, now: u64) {
        let fresh = self.fresh_signed(identity, now);
        self.previous_signed = Some(std::mem::replace(&mut self.signed, fresh));
        self.published = false;
    }

    pub fn needs_rotation(&self, now: u64, window_secs: u64) -> bool {
        now.saturating_sub(self.signed.created_at) >= window_secs
    }

    /// Drop the retained previous SPK once the grace period has passed.
    pub fn expire_previous(&mut self, now: u64, grace_secs: u64) {
        if let Some(prev) = &self.previous_signed {
            if now.saturating_sub(prev.created_at) > grace_secs {
                self.previous_signed = None;
            }
        }
    }

    pub fn refill_one_time(&mut self, up_to: usize) {
        while self.one_time.len() < up_to {
            let secret = StaticSecret::random_from_rng(OsRng);
            let public = X25519Public::from(&secret).to_bytes();
            let id = self.next_id;
            self.next_id += 1;
            self.one_time.push(OneTimePreKey {
                id,
                secret: secret.to_bytes(),
                public,
            });
        }
    }

    /// Consume the one-time prekey an initiator used.
    pub fn take_one_time(&mut self, id: u32) -> Result<OneTimePreKey, E2eeError> {
        let idx = self
            .one_time
            .iter()
            .position(|k| k.id == id)
            .ok_or(E2eeError::UnknownPreKey(id))?;
        Ok(self.one_time.remove(idx))
    }

    pub fn spk_secret_for(&self, id: u32) -> Option<StaticSecret> {
        if self.signed.id == id {
            return Some(self.signed.secret());
        }
        self.previous_signed
            .as_ref()
            .filter(|p| p.id == id)
            .map(|p| p.secret())
    }

    pub fn kem_public(&self) -> KemPublicKey {
        KemPublicKey(self.kem_public.clone())
    }

    pub fn kem_secret(&self) -> Result<KemSecretKey, E2eeError> {
        Ok(KemSecretKey::from_bytes(&self.kem_secret)?)
    }

    /// The publishable bundle, with one one-time prekey attached if any.
    pub fn bundle(&self, username: &str, identity: &IdentityKeyset) -> PreKeyBundle {
        let one_time = self.one_time.first();
        PreKeyBundle {
            username: username.to_string(),
            sign_public: *identity.sign_public(),
            dh_public: *identity.dh_public(),
            signed_prekey_id: self.signed.id,
            signed_prekey: self.signed.public,
            signed_prekey_sig: self.signed.signature.clone(),
            one_time_id: one_time.map(|k| k.id),
            one_time: one_time.map(|k| k.public),
            kem_public: self.kem_public.clone(),
        }
    }
}

fn spk_sig_payload(spk_public: &[u8; 32], kem_public: &[u8]) -> Vec<u8> {
    let mut payload = SPK_SIG_TAG.to_vec();
    payload.extend_from_slice(spk_public);
    payload.extend_from_slice(kem_public);
    payload
}

/// A peer's published bundle as fetched from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    pub username: String,
    pub sign_public: [u8; 32],
    pub dh_public: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey: [u8; 32],
    pub signed_prekey_sig: Vec<u8>,
    pub one_time_id: Option<u32>,
    pub one_time: Option<[u8; 32]>,
    pub kem_public: Vec<u8>,
}

impl PreKeyBundle {
    /// Verify the SPK+KEM signature before any DH is computed.
    pub fn verify(&self) -> Result<(), E2eeError> {
        identity::verify_signature(
            &self.sign_public,
            &spk_sig_payload(&self.signed_prekey, &self.kem_public),
            &self.signed_prekey_sig,
        )
        .map_err(|_| E2eeError::BadBundle("signed prekey signature invalid".into()))
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        identity::fingerprint(&self.sign_public, &self.dh_public)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(128 + self.kem_public.len());
        wire::write_string(&self.username, &mut out)?;
        wire::write_arr32(&self.sign_public, &mut out);
        wire::write_arr32(&self.dh_public, &mut out);
        wire::write_u32(self.signed_prekey_id, &mut out);
        wire::write_arr32(&self.signed_prekey, &mut out);
        wire::write_bytes(&self.signed_prekey_sig, &mut out)?;
        match (self.one_time_id, self.one_time) {
            (Some(id), Some(public)) => {
                wire::write_u8(1, &mut out);
                wire::write_u32(id, &mut out);
                wire::write_arr32(&public, &mut out);
            }
            _ => wire::write_u8(0, &mut out),
        }
        wire::write_bytes(&self.kem_public, &mut out)?;
        Ok(out)
    }

    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, ProtoError> {
        let username = r.read_string()?;
        let sign_public = r.read_arr32()?;
        let dh_public = r.read_arr32()?;
        let signed_prekey_id = r.read_u32()?;
        let signed_prekey = r.read_arr32()?;
        let signed_prekey_sig = r.read_bytes()?;
        let (one_time_id, one_time) = if r.read_u8()? != 0 {
            (Some(r.read_u32()?), Some(r.read_arr32()?))
        } else {
            (None, None)
        };
        let kem_public = r.read_bytes()?;
        Ok(Self {
            username,
            sign_public,
            dh_public,
            signed_prekey_id,
            signed_prekey,
            signed_prekey_sig,
            one_time_id,
            one_time,
            kem_public,
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let mut r = Reader::new(data);
        let bundle = Self::read_from(&mut r)?;
        r.finish()?;
        Ok(bundle)
    }
}
