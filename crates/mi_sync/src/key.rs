//! The device-sync key.
//!
//! An all-zero key is never legal; it is what a wiped or never-initialised
//! key slot reads as, so every install path rejects it. The on-disk form is
//! wrapped by the platform secret store under the magic and entropy tags
//! below.

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SyncError;

/// Magic for the platform-wrapped key file.
pub const KEY_FILE_MAGIC: &str = "MI_E2EE_DEVICE_SYNC_KEY_DPAPI1";
/// Entropy tag mixed into the platform wrap.
pub const KEY_FILE_ENTROPY: &str = "MI_E2EE_DEVICE_SYNC_KEY_ENTROPY_V1";
/// Refuse key files larger than this before parsing.
pub const MAX_KEY_FILE_BYTES: u64 = 64 * 1024;

#[derive(Clone, ZeroizeOnDrop)]
pub struct DeviceSyncKey([u8; 32]);

impl DeviceSyncKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        let key: [u8; 32] = bytes.try_into().map_err(|_| SyncError::InvalidKey)?;
        if is_all_zero(&key) {
            return Err(SyncError::InvalidKey);
        }
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Replace this key with `next`, wiping the old value first.
    pub fn rotate_to(&mut self, next: DeviceSyncKey) {
        self.0.zeroize();
        self.0 = next.0;
    }
}

pub fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, b| acc | b) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_is_nonzero() {
        let key = DeviceSyncKey::generate();
        assert!(!is_all_zero(key.as_bytes()));
    }

    #[test]
    fn all_zero_rejected() {
        assert_eq!(
            DeviceSyncKey::from_bytes(&[0u8; 32]).err(),
            Some(SyncError::InvalidKey)
        );
        assert!(DeviceSyncKey::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn rotation_replaces_value() {
        let mut key = DeviceSyncKey::generate();
        let next = DeviceSyncKey::generate();
        let expected = *next.as_bytes();
        key.rotate_to(next);
        assert_eq!(key.as_bytes(), &expected);
    }
}
