//! Persisted state layout, one user under `<data>/e2ee_state`:
//!
//! - `device_id.txt`        — 32 hex chars, owner-only
//! - `kt_state.bin`         — `MIKTSTH1 ∥ u64 tree_size ∥ 32B root`
//! - `device_sync_key.bin`  — wrapped 32-byte sync key
//! - `server_trust.ini`     — wrapped pin store (see `store::trust`)
//! - `identity.bin`, `prekeys.bin`, `sessions.bin`, `peer_trust.bin`
//!                          — wrapped identity / ratchet material
//! - `instance.lock`        — single-writer advisory lock
//!
//! Every write goes through the atomic-write primitive.

use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use zeroize::Zeroizing;

use mi_e2ee::prekeys::PreKeyStore;
use mi_e2ee::ratchet::RatchetSession;
use mi_e2ee::trust::PeerTrust;
use mi_kt::KtSnapshot;
use mi_sync::key::{DeviceSyncKey, KEY_FILE_ENTROPY, KEY_FILE_MAGIC, MAX_KEY_FILE_BYTES};

use mi_crypto::identity::IdentityKeyset;

use crate::error::ClientError;
use crate::store::{fs, secure_store};

const IDENTITY_MAGIC: &str = "MI_E2EE_IDENTITY_DPAPI1";
const IDENTITY_ENTROPY: &str = "MI_E2EE_IDENTITY_ENTROPY_V1";
const PREKEYS_MAGIC: &str = "MI_E2EE_PREKEYS_DPAPI1";
const PREKEYS_ENTROPY: &str = "MI_E2EE_PREKEYS_ENTROPY_V1";
const SESSIONS_MAGIC: &str = "MI_E2EE_SESSIONS_DPAPI1";
const SESSIONS_ENTROPY: &str = "MI_E2EE_SESSIONS_ENTROPY_V1";
const PEER_TRUST_MAGIC: &str = "MI_E2EE_PEER_TRUST_DPAPI1";
const PEER_TRUST_ENTROPY: &str = "MI_E2EE_PEER_TRUST_ENTROPY_V1";

pub struct StateStore {
    dir: PathBuf,
    username: String,
}

impl StateStore {
    pub fn open(data_dir: &Path, username: &str) -> Result<Self, ClientError> {
        let dir = data_dir.join("e2ee_state");
        std::fs::create_dir_all(&dir)
            .map_err(|e| ClientError::Resource(format!("create state dir: {e}")))?;
        Ok(Self {
            dir,
            username: username.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("instance.lock")
    }

    pub fn trust_store_path(&self) -> PathBuf {
        self.dir.join("server_trust.ini")
    }

    // ── device id ────────────────────────────────────────────────────────

    pub fn load_or_create_device_id(&self) -> Result<String, ClientError> {
        let path = self.dir.join("device_id.txt");
        if path.exists() {
            fs::check_not_world_writable(&path)?;
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ClientError::Resource(format!("read device id: {e}")))?;
            let id = text.trim().to_ascii_lowercase();
            if id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit()) {
                return Ok(id);
            }
            return Err(ClientError::Resource("device id file corrupt".into()));
        }
        let mut raw = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let id = hex::encode(raw);
        fs::atomic_write(&path, id.as_bytes())?;
        fs::restrict_permissions(&path)?;
        Ok(id)
    }

    // ── KT snapshot ──────────────────────────────────────────────────────

    pub fn load_kt_snapshot(&self) -> Result<Option<KtSnapshot>, ClientError> {
        let path = self.dir.join("kt_state.bin");
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| ClientError::Resource(format!("read kt state: {e}")))?;
        Ok(Some(KtSnapshot::decode(&bytes)?))
    }

    pub fn store_kt_snapshot(&self, snapshot: &KtSnapshot) -> Result<(), ClientError> {
        fs::atomic_write(&self.dir.join("kt_state.bin"), &snapshot.encode())
    }

    // ── device sync key ──────────────────────────────────────────────────

    pub fn load_device_sync_key(&self) -> Result<Option<DeviceSyncKey>, ClientError> {
        let path = self.dir.join("device_sync_key.bin");
        if !path.exists() {
            return Ok(None);
        }
        fs::check_not_world_writable(&path)?;
        let meta = std::fs::metadata(&path)
            .map_err(|e| ClientError::Resource(format!("stat sync key: {e}")))?;
        if meta.len() > MAX_KEY_FILE_BYTES {
            return Err(ClientError::Resource("device sync key file too large".into()));
        }
        let bytes = std::fs::read(&path)
            .map_err(|e| ClientError::Resource(format!("read sync key: {e}")))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let (plain, was_wrapped) =
            secure_store::maybe_unprotect(&self.dir, &self.username, KEY_FILE_MAGIC, KEY_FILE_ENTROPY, &bytes)?;
        let key = DeviceSyncKey::from_bytes(&plain)
            .map_err(|_| ClientError::Resource("device sync key invalid".into()))?;
        if !was_wrapped {
            // Legacy plaintext file: wrap it now.
            self.store_device_sync_key(&key)?;
        }
        Ok(Some(key))
    }

    pub fn store_device_sync_key(&self, key: &DeviceSyncKey) -> Result<(), ClientError> {
        let path = self.dir.join("device_sync_key.bin");
        let wrapped = secure_store::protect(
            &self.dir,
            &self.username,
            KEY_FILE_MAGIC,
            KEY_FILE_ENTROPY,
            key.as_bytes(),
        )?;
        fs::atomic_write(&path, &wrapped)?;
        fs::restrict_permissions(&path)
    }

    // ── identity keyset ──────────────────────────────────────────────────

    pub fn load_or_create_identity(&self) -> Result<IdentityKeyset, ClientError> {
        let path = self.dir.join("identity.bin");
        if path.exists() {
            fs::check_not_world_writable(&path)?;
            let bytes = std::fs::read(&path)
                .map_err(|e| ClientError::Resource(format!("read identity: {e}")))?;
            let (plain, _) = secure_store::maybe_unprotect(
                &self.dir,
                &self.username,
                IDENTITY_MAGIC,
                IDENTITY_ENTROPY,
                &bytes,
            )?;
            return Ok(IdentityKeyset::from_bytes(&plain)?);
        }
        let identity = IdentityKeyset::generate();
        self.store_identity(&identity)?;
        Ok(identity)
    }

    pub fn store_identity(&self, identity: &IdentityKeyset) -> Result<(), ClientError> {
        let path = self.dir.join("identity.bin");
        let plain = identity.to_bytes();
        let wrapped =
            secure_store::protect(&self.dir, &self.username, IDENTITY_MAGIC, IDENTITY_ENTROPY, &plain[..])?;
        fs::atomic_write(&path, &wrapped)?;
        fs::restrict_permissions(&path)
    }

    // ── wrapped JSON blobs ───────────────────────────────────────────────

    fn load_wrapped_json<T: DeserializeOwned>(
        &self,
        name: &str,
        magic: &str,
        entropy: &str,
    ) -> Result<Option<T>, ClientError> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        fs::check_not_world_writable(&path)?;
        let bytes =
            std::fs::read(&path).map_err(|e| ClientError::Resource(format!("read {name}: {e}")))?;
        let (plain, _) = secure_store::maybe_unprotect(&self.dir, &self.username, magic, entropy, &bytes)?;
        let value = serde_json::from_slice(&plain)
            .map_err(|e| ClientError::Resource(format!("parse {name}: {e}")))?;
        Ok(Some(value))
    }

    fn store_wrapped_json<T: Serialize>(
        &self,
        name: &str,
        magic: &str,
        entropy: &str,
        value: &T,
    ) -> Result<(), ClientError> {
        let plain = Zeroizing::new(
            serde_json::to_vec(value)
                .map_err(|e| ClientError::Resource(format!("serialize {name}: {e}")))?,
        );
        let wrapped = secure_store::protect(&self.dir, &self.username, magic, entropy, &plain)?;
        let path = self.dir.join(name);
        fs::atomic_write(&path, &wrapped)?;
        fs::restrict_permissions(&path)
    }

    pub fn load_prekeys(&self) -> Result<Option<PreKeyStore>, ClientError> {
        self.load_wrapped_json("prekeys.bin", PREKEYS_MAGIC, PREKEYS_ENTROPY)
    }

    pub fn store_prekeys(&self, prekeys: &PreKeyStore) -> Result<(), ClientError> {
        self.store_wrapped_json("prekeys.bin", PREKEYS_MAGIC, PREKEYS_ENTROPY, prekeys)
    }

    pub fn load_sessions(&self) -> Result<Vec<RatchetSession>, ClientError> {
        Ok(self
            .load_wrapped_json("sessions.bin", SESSIONS_MAGIC, SESSIONS_ENTROPY)?
            .unwrap_or_default())
    }

    pub fn store_sessions(&self, sessions: &[RatchetSession]) -> Result<(), ClientError> {
        self.store_wrapped_json("sessions.bin", SESSIONS_MAGIC, SESSIONS_ENTROPY, &sessions)
    }

    pub fn load_peer_trust(&self) -> Result<PeerTrust, ClientError> {
        Ok(self
            .load_wrapped_json("peer_trust.bin", PEER_TRUST_MAGIC, PEER_TRUST_ENTROPY)?
            .unwrap_or_default())
    }

    pub fn store_peer_trust(&self, trust: &PeerTrust) -> Result<(), ClientError> {
        self.store_wrapped_json("peer_trust.bin", PEER_TRUST_MAGIC, PEER_TRUST_ENTROPY, trust)
    }

    /// Wipe the whole state directory (account removal, not logout).
    pub fn wipe(&self) -> Result<(), ClientError> {
        std::fs::remove_dir_all(&self.dir)
            .map_err(|e| ClientError::Resource(format!("wipe state: {e}")))
    }
}
