//! Key derivation functions
//!
//! `hkdf_expand` — HKDF-SHA256, used for every chain/session key schedule.
//! `argon2id_derive` — the legacy handshake's password stretch; the server
//! supplies (salt, blocks, passes) and the parameters are validated here so
//! a malicious relay cannot request a memory bomb.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::CryptoError;

/// Upper bounds on server-issued Argon2id parameters.
const MAX_ARGON2_MEMORY_KIB: u32 = 512 * 1024;
const MAX_ARGON2_PASSES: u32 = 16;

/// Expand `ikm` (+ optional salt) into `output.len()` bytes keyed by `info`.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive 32 bytes from a password with server-issued Argon2id parameters.
pub fn argon2id_derive(
    password: &[u8],
    salt: &[u8],
    memory_kib: u32,
    passes: u32,
) -> Result<[u8; 32], CryptoError> {
    if memory_kib == 0 || memory_kib > MAX_ARGON2_MEMORY_KIB {
        return Err(CryptoError::KeyDerivation(format!(
            "argon2 memory out of range: {memory_kib} KiB"
        )));
    }
    if passes == 0 || passes > MAX_ARGON2_PASSES {
        return Err(CryptoError::KeyDerivation(format!(
            "argon2 passes out of range: {passes}"
        )));
    }
    let params = Params::new(memory_kib, passes, 1, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(output)
}

/// Fresh random 16-byte salt.
pub fn generate_salt() -> [u8; 16] {
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}
