//! Device pairing.
//!
//! A 16-byte secret is rendered as a hex code (grouped in fours) and moved
//! between devices out of band. Both sides derive:
//!
//!   pairing_id  = hex(SHA-256("mi_e2ee_pairing_id_v1" ∥ secret))[..32]
//!   pairing_key = HKDF-SHA256(secret, info = "mi_e2ee_pairing_key_v1")
//!
//! The id is public (the relay routes on it); the key seals the request and
//! response payloads. The secret is wiped right after derivation, and the
//! whole state wipes on success or cancel.

use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use mi_crypto::{hash, kdf};

use crate::error::SyncError;

const PAIRING_ID_TAG: &[u8] = b"mi_e2ee_pairing_id_v1";
const PAIRING_KEY_INFO: &[u8] = b"mi_e2ee_pairing_key_v1";

/// Strip whitespace and dashes, lowercase; the forgiving inverse of
/// [`render_code`].
pub fn normalize_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Render a pairing secret as `xxxx xxxx …` for reading aloud.
pub fn render_code(secret: &[u8; 16]) -> String {
    let hex = hex::encode(secret);
    hex.as_bytes()
        .chunks(4)
        .map(|c| std::str::from_utf8(c).expect("hex is ascii"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a user-typed pairing code back into the 16-byte secret.
pub fn parse_code(code: &str) -> Result<[u8; 16], SyncError> {
    let norm = normalize_code(code);
    let bytes = hex::decode(&norm).map_err(|_| SyncError::BadPairingCode)?;
    bytes.try_into().map_err(|_| SyncError::BadPairingCode)
}

/// Derive `(pairing_id, pairing_key)` from the secret.
pub fn derive(secret: &[u8; 16]) -> Result<(String, [u8; 32]), SyncError> {
    let digest = hash::sha256_tagged(PAIRING_ID_TAG, &[secret]);
    let pairing_id = hex::encode(digest)[..32].to_string();
    let mut key = [0u8; 32];
    kdf::hkdf_expand(secret, None, PAIRING_KEY_INFO, &mut key)
        .map_err(|_| SyncError::BadPairingCode)?;
    Ok((pairing_id, key))
}

/// Live pairing state for either role. Exactly one pairing at a time.
#[derive(ZeroizeOnDrop)]
pub struct PairingState {
    #[zeroize(skip)]
    pub active: bool,
    #[zeroize(skip)]
    pub is_primary: bool,
    #[zeroize(skip)]
    pub wait_response: bool,
    #[zeroize(skip)]
    pub pairing_id: String,
    key: [u8; 32],
    request_id: [u8; 16],
}

impl Default for PairingState {
    fn default() -> Self {
        Self {
            active: false,
            is_primary: false,
            wait_response: false,
            pairing_id: String::new(),
            key: [0u8; 32],
            request_id: [0u8; 16],
        }
    }
}

impl PairingState {
    /// Primary side: mint a secret, derive, return the code to display.
    pub fn begin_primary(&mut self) -> Result<String, SyncError> {
        let mut secret = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let (pairing_id, key) = derive(&secret)?;
        let code = render_code(&secret);
        secret.zeroize();

        self.active = true;
        self.is_primary = true;
        self.wait_response = false;
        self.pairing_id = pairing_id;
        self.key = key;
        self.request_id = [0u8; 16];
        Ok(code)
    }

    /// Linked side: derive from the typed code and mint a request id.
    pub fn begin_linked(&mut self, code: &str) -> Result<(), SyncError> {
        let mut secret = parse_code(code)?;
        let (pairing_id, key) = derive(&secret)?;
        secret.zeroize();

        let mut request_id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut request_id);

        self.active = true;
        self.is_primary = false;
        self.wait_response = true;
        self.pairing_id = pairing_id;
        self.key = key;
        self.request_id = request_id;
        Ok(())
    }

    pub fn key(&self) -> Result<&[u8; 32], SyncError> {
        if !self.active {
            return Err(SyncError::PairingNotActive);
        }
        Ok(&self.key)
    }

    pub fn request_id(&self) -> &[u8; 16] {
        &self.request_id
    }

    /// Primary with a live pairing, able to poll requests.
    pub fn primary_ready(&self) -> bool {
        self.active
            && self.is_primary
            && !self.pairing_id.is_empty()
            && !crate::key::is_all_zero(&self.key)
    }

    /// Linked device awaiting a response.
    pub fn linked_pending(&self) -> bool {
        self.active
            && !self.is_primary
            && self.wait_response
            && !self.pairing_id.is_empty()
            && !crate::key::is_all_zero(&self.key)
            && !crate::key::is_all_zero(&self.request_id)
    }

    /// Wipe everything; called on success and on cancel alike.
    pub fn cancel(&mut self) {
        self.active = false;
        self.is_primary = false;
        self.wait_response = false;
        self.pairing_id.clear();
        self.key.zeroize();
        self.request_id.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip_with_messy_input() {
        let secret = [0xA5u8; 16];
        let code = render_code(&secret);
        assert_eq!(code.len(), 32 + 7); // 8 groups of 4 + 7 separators
        let typed = format!("  {} ", code.to_uppercase().replace(' ', "-"));
        assert_eq!(parse_code(&typed).unwrap(), secret);
    }

    #[test]
    fn bad_codes_rejected() {
        assert!(parse_code("xyzq").is_err());
        assert!(parse_code("abcd").is_err()); // too short
        assert!(parse_code(&"ab".repeat(17)).is_err()); // too long
    }

    #[test]
    fn both_roles_derive_the_same_material() {
        let mut primary = PairingState::default();
        let code = primary.begin_primary().unwrap();
        assert!(primary.primary_ready());

        let mut linked = PairingState::default();
        linked.begin_linked(&code).unwrap();
        assert!(linked.linked_pending());

        assert_eq!(primary.pairing_id, linked.pairing_id);
        assert_eq!(primary.key().unwrap(), linked.key().unwrap());
        assert_eq!(primary.pairing_id.len(), 32);
    }

    #[test]
    fn cancel_wipes_state() {
        let mut state = PairingState::default();
        state.begin_primary().unwrap();
        state.cancel();
        assert!(!state.active);
        assert!(state.key().is_err());
        assert!(crate::key::is_all_zero(state.request_id()));
        assert!(!state.primary_ready());
    }
}
