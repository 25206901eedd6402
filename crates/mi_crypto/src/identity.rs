//! Identity key management
//!
//! Each user has one long-term `IdentityKeyset`: an Ed25519 signing keypair
//! plus an X25519 DH keypair. The fingerprint commits to both publics under a
//! domain tag; the SAS is a short human-comparable rendering of it.
//!
//! Key-change policy (NON-NEGOTIABLE)
//! -----------------------------------
//! If the stored fingerprint for a trusted peer changes, the engine MUST
//! block encryption to that peer until the user re-verifies via SAS.
//! This module produces the key material; enforcement lives in mi_e2ee.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::{ct, error::CryptoError, hash};

const FINGERPRINT_TAG: &[u8] = b"mi_e2ee_fingerprint_v1";
const SAS_TAG: &[u8] = b"mi_e2ee_sas_v1";

/// Long-term identity: Ed25519 signing + X25519 DH. Secrets wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyset {
    sign_secret: [u8; 32],
    dh_secret: [u8; 32],
    #[zeroize(skip)]
    sign_public: [u8; 32],
    #[zeroize(skip)]
    dh_public: [u8; 32],
}

impl IdentityKeyset {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let dh = StaticSecret::random_from_rng(OsRng);
        let sign_public = signing.verifying_key().to_bytes();
        let dh_public = X25519Public::from(&dh).to_bytes();
        Self {
            sign_secret: signing.to_bytes(),
            dh_secret: dh.to_bytes(),
            sign_public,
            dh_public,
        }
    }

    /// Restore from the persisted 64-byte form (`sign_secret ∥ dh_secret`).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidKey(format!(
                "identity keyset must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut sign_secret = [0u8; 32];
        let mut dh_secret = [0u8; 32];
        sign_secret.copy_from_slice(&bytes[..32]);
        dh_secret.copy_from_slice(&bytes[32..]);
        let signing = SigningKey::from_bytes(&sign_secret);
        let dh = StaticSecret::from(dh_secret);
        let sign_public = signing.verifying_key().to_bytes();
        let dh_public = X25519Public::from(&dh).to_bytes();
        Ok(Self {
            sign_secret,
            dh_secret,
            sign_public,
            dh_public,
        })
    }

    /// Persisted form; the caller is responsible for wrapping it.
    pub fn to_bytes(&self) -> zeroize::Zeroizing<[u8; 64]> {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.sign_secret);
        out[32..].copy_from_slice(&self.dh_secret);
        zeroize::Zeroizing::new(out)
    }

    pub fn sign_public(&self) -> &[u8; 32] {
        &self.sign_public
    }

    pub fn dh_public(&self) -> &[u8; 32] {
        &self.dh_public
    }

    pub fn dh_secret(&self) -> StaticSecret {
        StaticSecret::from(self.dh_secret)
    }

    /// Sign arbitrary bytes; 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.sign_secret).sign(msg).to_bytes()
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        fingerprint(&self.sign_public, &self.dh_public)
    }
}

/// Verify a signature made by any Ed25519 public key.
pub fn verify_signature(
    public: &[u8; 32],
    msg: &[u8],
    sig_bytes: &[u8],
) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(public).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_bytes(
        sig_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("bad signature length".into()))?,
    );
    vk.verify(msg, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

/// Fingerprint = SHA-256(tag ∥ sig_pub ∥ dh_pub).
pub fn fingerprint(sign_public: &[u8; 32], dh_public: &[u8; 32]) -> [u8; 32] {
    hash::sha256_tagged(FINGERPRINT_TAG, &[sign_public, dh_public])
}

/// Constant-time fingerprint comparison.
pub fn fingerprints_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    ct::ct_eq(a, b)
}

/// Short authentication string: SHA-256(tag ∥ fp) truncated to 20 hex chars,
/// grouped in fours for reading aloud. Example: "a1b2 c3d4 e5f6 7890 abcd".
pub fn sas_string(fp: &[u8; 32]) -> String {
    let digest = hash::sha256_tagged(SAS_TAG, &[fp]);
    let hex = hex::encode(digest);
    hex[..20]
        .as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).expect("hex is ascii"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// SAS over a hex-rendered server certificate fingerprint (pin confirm flow).
pub fn sas_for_hex_fingerprint(fp_hex: &str) -> Result<String, CryptoError> {
    let bytes = hex::decode(fp_hex)?;
    let fp: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("fingerprint must be 32 bytes".into()))?;
    Ok(sas_string(&fp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let keys = IdentityKeyset::generate();
        let sig = keys.sign(b"message");
        verify_signature(keys.sign_public(), b"message", &sig).unwrap();
        assert!(verify_signature(keys.sign_public(), b"other", &sig).is_err());
    }

    #[test]
    fn persist_roundtrip() {
        let keys = IdentityKeyset::generate();
        let restored = IdentityKeyset::from_bytes(&keys.to_bytes()[..]).unwrap();
        assert_eq!(keys.sign_public(), restored.sign_public());
        assert_eq!(keys.dh_public(), restored.dh_public());
        assert_eq!(keys.fingerprint(), restored.fingerprint());
    }

    #[test]
    fn sas_is_stable_and_distinct() {
        let a = IdentityKeyset::generate();
        let b = IdentityKeyset::generate();
        let sas_a = sas_string(&a.fingerprint());
        assert_eq!(sas_a, sas_string(&a.fingerprint()));
        assert_ne!(sas_a, sas_string(&b.fingerprint()));
        // 20 hex chars in 5 groups of 4 → 24 chars with separators
        assert_eq!(sas_a.len(), 24);
    }

    #[test]
    fn identity_dh_commutes() {
        let a = IdentityKeyset::generate();
        let b = IdentityKeyset::generate();
        let ab = a.dh_secret().diffie_hellman(&X25519Public::from(*b.dh_public()));
        let ba = b.dh_secret().diffie_hellman(&X25519Public::from(*a.dh_public()));
        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }
}
