//! Platform-wrapped secret files.
//!
//! Each secret-carrying file is sealed under a device-local wrapping key,
//! with an ASCII magic and an entropy tag for domain separation:
//!
//!   `magic ∥ 0x00 ∥ nonce(24) ∥ mac(16) ∥ cipher`
//!
//! The wrapping key lives in the OS keyring. On hosts without a usable
//! keyring (headless servers, containers) it falls back to a 0600 key file
//! in the state directory; the files stay wrapped either way. A legacy
//! plaintext file (no magic) is accepted once and re-wrapped by the caller
//! on the next store.

use std::path::Path;

use keyring::Entry;
use rand::RngCore;
use zeroize::Zeroizing;

use mi_crypto::aead;

use crate::error::ClientError;
use crate::store::fs;

const KEYRING_SERVICE: &str = "MichatE2ee";
const WRAP_KEY_ENTRY: &str = "secret_wrap_key";
const WRAP_KEY_FILE: &str = "wrap_key.bin";

fn keyring_wrap_key(username: &str) -> Result<Zeroizing<[u8; 32]>, ClientError> {
    let entry = Entry::new(KEYRING_SERVICE, &format!("{WRAP_KEY_ENTRY}:{username}"))
        .map_err(|e| ClientError::Resource(format!("keyring init: {e}")))?;
    match entry.get_password() {
        Ok(hex_key) => {
            let bytes = hex::decode(hex_key.as_str())
                .map_err(|_| ClientError::Resource("keyring entry corrupt".into()))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| ClientError::Resource("keyring entry corrupt".into()))?;
            Ok(Zeroizing::new(key))
        }
        Err(keyring::Error::NoEntry) => {
            let mut key = Zeroizing::new([0u8; 32]);
            rand::rngs::OsRng.fill_bytes(key.as_mut());
            entry
                .set_password(&hex::encode(key.as_ref() as &[u8]))
                .map_err(|e| ClientError::Resource(format!("keyring store: {e}")))?;
            Ok(key)
        }
        Err(e) => Err(ClientError::Resource(format!("keyring read: {e}"))),
    }
}

fn file_wrap_key(dir: &Path) -> Result<Zeroizing<[u8; 32]>, ClientError> {
    let path = dir.join(WRAP_KEY_FILE);
    if path.exists() {
        fs::check_not_world_writable(&path)?;
        let bytes = std::fs::read(&path)
            .map_err(|e| ClientError::Resource(format!("read wrap key: {e}")))?;
        let key: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| ClientError::Resource("wrap key file corrupt".into()))?;
        return Ok(Zeroizing::new(key));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    rand::rngs::OsRng.fill_bytes(key.as_mut());
    fs::atomic_write(&path, key.as_ref())?;
    fs::restrict_permissions(&path)?;
    Ok(key)
}

/// Fetch (or mint on first use) the device-local wrapping key. Keyring
/// first; key file in the state directory when no keyring is reachable.
fn wrap_key(dir: &Path, username: &str) -> Result<Zeroizing<[u8; 32]>, ClientError> {
    match keyring_wrap_key(username) {
        Ok(key) => Ok(key),
        Err(_) => file_wrap_key(dir),
    }
}

fn file_ad(magic: &str, entropy: &str) -> Vec<u8> {
    let mut ad = magic.as_bytes().to_vec();
    ad.push(0);
    ad.extend_from_slice(entropy.as_bytes());
    ad
}

/// Wrap `plain` for disk under (magic, entropy).
pub fn protect(
    dir: &Path,
    username: &str,
    magic: &str,
    entropy: &str,
    plain: &[u8],
) -> Result<Vec<u8>, ClientError> {
    let key = wrap_key(dir, username)?;
    let sealed = aead::seal_prefixed(&key, &file_ad(magic, entropy), plain)?;
    let mut out = Vec::with_capacity(magic.len() + 1 + sealed.len());
    out.extend_from_slice(magic.as_bytes());
    out.push(0);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Unwrap a file. Returns `(plain, was_wrapped)`; a file without the magic
/// is treated as legacy plaintext and handed back verbatim.
pub fn maybe_unprotect(
    dir: &Path,
    username: &str,
    magic: &str,
    entropy: &str,
    data: &[u8],
) -> Result<(Zeroizing<Vec<u8>>, bool), ClientError> {
    let prefix_len = magic.len() + 1;
    let wrapped = data.len() > prefix_len
        && &data[..magic.len()] == magic.as_bytes()
        && data[magic.len()] == 0;
    if !wrapped {
        return Ok((Zeroizing::new(data.to_vec()), false));
    }
    let key = wrap_key(dir, username)?;
    let plain = aead::open_prefixed(&key, &file_ad(magic, entropy), &data[prefix_len..])
        .map_err(|_| ClientError::AuthFailure)?;
    Ok((plain, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn wrap_roundtrip_with_file_fallback_key() {
        let dir = tempdir().unwrap();
        // Force the file path by using it directly.
        let key = file_wrap_key(dir.path()).unwrap();
        let again = file_wrap_key(dir.path()).unwrap();
        assert_eq!(key.as_ref() as &[u8], again.as_ref() as &[u8]);

        let sealed =
            aead::seal_prefixed(&key, &file_ad("MI_TRUST1", "mi_e2ee_trust_store_v1"), b"a=b")
                .unwrap();
        let opened = aead::open_prefixed(
            &key,
            &file_ad("MI_TRUST1", "mi_e2ee_trust_store_v1"),
            &sealed,
        )
        .unwrap();
        assert_eq!(&opened[..], b"a=b");
    }

    #[test]
    fn entropy_tag_separates_domains() {
        let dir = tempdir().unwrap();
        let data = protect(dir.path(), "test", "MI_TRUST1", "mi_e2ee_trust_store_v1", b"x=y")
            .unwrap();
        assert!(data.starts_with(b"MI_TRUST1\0"));
        let (plain, wrapped) =
            maybe_unprotect(dir.path(), "test", "MI_TRUST1", "mi_e2ee_trust_store_v1", &data)
                .unwrap();
        assert!(wrapped);
        assert_eq!(&plain[..], b"x=y");
        assert!(maybe_unprotect(dir.path(), "test", "MI_TRUST1", "other_entropy", &data).is_err());
    }

    #[test]
    fn legacy_plaintext_detected() {
        let dir = tempdir().unwrap();
        let (plain, was_wrapped) = maybe_unprotect(
            dir.path(),
            "test",
            "MI_TRUST1",
            "mi_e2ee_trust_store_v1",
            b"host=fp",
        )
        .unwrap();
        assert!(!was_wrapped);
        assert_eq!(&plain[..], b"host=fp");
    }
}
