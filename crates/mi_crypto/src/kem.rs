//! ML-KEM-768 facade
//!
//! The hybrid session setup mixes an ML-KEM-768 shared secret into the X3DH
//! key material so a future discrete-log break does not expose recorded
//! traffic. Byte-oriented wrappers keep pqcrypto types at this boundary.

use pqcrypto_mlkem::mlkem768;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _,
};
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

pub const KEM_PUBLIC_LEN: usize = 1184;
pub const KEM_SECRET_LEN: usize = 2400;
pub const KEM_CIPHERTEXT_LEN: usize = 1088;
pub const KEM_SHARED_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KemPublicKey(pub Vec<u8>);

#[derive(ZeroizeOnDrop)]
pub struct KemSecretKey(Vec<u8>);

#[derive(Clone, Debug)]
pub struct KemCiphertext(pub Vec<u8>);

impl KemPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_PUBLIC_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "KEM public key must be {KEM_PUBLIC_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl KemSecretKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_SECRET_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "KEM secret key must be {KEM_SECRET_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl KemCiphertext {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEM_CIPHERTEXT_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "KEM ciphertext must be {KEM_CIPHERTEXT_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

pub fn keypair() -> (KemPublicKey, KemSecretKey) {
    let (pk, sk) = mlkem768::keypair();
    (
        KemPublicKey(pk.as_bytes().to_vec()),
        KemSecretKey(sk.as_bytes().to_vec()),
    )
}

/// Encapsulate to a peer public key; returns `(shared_secret, ciphertext)`.
pub fn encapsulate(public: &KemPublicKey) -> Result<([u8; 32], KemCiphertext), CryptoError> {
    let pk = mlkem768::PublicKey::from_bytes(&public.0)
        .map_err(|e| CryptoError::Kem(e.to_string()))?;
    let (ss, ct) = mlkem768::encapsulate(&pk);
    let mut shared = [0u8; 32];
    shared.copy_from_slice(ss.as_bytes());
    Ok((shared, KemCiphertext(ct.as_bytes().to_vec())))
}

/// Decapsulate with our secret key.
pub fn decapsulate(
    ciphertext: &KemCiphertext,
    secret: &KemSecretKey,
) -> Result<[u8; 32], CryptoError> {
    let ct = mlkem768::Ciphertext::from_bytes(&ciphertext.0)
        .map_err(|e| CryptoError::Kem(e.to_string()))?;
    let sk = mlkem768::SecretKey::from_bytes(&secret.0)
        .map_err(|e| CryptoError::Kem(e.to_string()))?;
    let ss = mlkem768::decapsulate(&ct, &sk);
    let mut shared = [0u8; 32];
    shared.copy_from_slice(ss.as_bytes());
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_decapsulate_agree() {
        let (pk, sk) = keypair();
        assert_eq!(pk.as_bytes().len(), KEM_PUBLIC_LEN);
        let (shared_a, ct) = encapsulate(&pk).unwrap();
        assert_eq!(ct.as_bytes().len(), KEM_CIPHERTEXT_LEN);
        let shared_b = decapsulate(&ct, &sk).unwrap();
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(KemPublicKey::from_bytes(&[0u8; 10]).is_err());
        assert!(KemCiphertext::from_bytes(&[0u8; 10]).is_err());
    }
}
