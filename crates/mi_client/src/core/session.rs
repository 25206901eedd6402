//! Session operations: register, login, logout, heartbeat, device list.

use tracing::{debug, info};
use zeroize::Zeroizing;

use mi_proto::frame::FrameType;
use mi_proto::sync_event::SyncEvent;
use mi_proto::wire::{self, Reader};
use mi_sync::key::DeviceSyncKey;

use crate::channel::SecureChannel;
use crate::config::AuthMode;
use crate::core::ClientCore;
use crate::error::ClientError;
use crate::handshake::{opaque, LegacyClient, LegacyHelloResponse};

const REGISTER_SUB_START: u8 = 1;
const REGISTER_SUB_FINISH: u8 = 2;

/// Legacy registration stretch parameters (client-chosen).
const REGISTER_ARGON_MEMORY_KIB: u32 = 64 * 1024;
const REGISTER_ARGON_PASSES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub last_seen: u64,
}

impl ClientCore {
    /// Create the account on the relay and publish our identity publics.
    pub fn register(&mut self, password: &str) -> Result<(), ClientError> {
        if password.is_empty() {
            return Err(ClientError::InvalidInput("password empty".into()));
        }
        match self.config.auth_mode {
            AuthMode::Opaque => self.register_opaque(password),
            AuthMode::Legacy => self.register_legacy(password),
        }
    }

    fn register_opaque(&mut self, password: &str) -> Result<(), ClientError> {
        let (state, request) = opaque::register_start(password)?;

        let mut payload = Vec::new();
        wire::write_u8(REGISTER_SUB_START, &mut payload);
        wire::write_string(&self.username, &mut payload)?;
        wire::write_bytes(&request, &mut payload)?;
        let response = self.process_plain(FrameType::Register, &payload)?;
        let mut r = Reader::new(&response);
        let registration_response = r.read_bytes()?;
        r.finish()?;

        let upload = opaque::register_finish(&state, password, &registration_response)?;

        let mut payload = Vec::new();
        wire::write_u8(REGISTER_SUB_FINISH, &mut payload);
        wire::write_string(&self.username, &mut payload)?;
        wire::write_bytes(&upload, &mut payload)?;
        wire::write_arr32(self.identity.sign_public(), &mut payload);
        wire::write_arr32(self.identity.dh_public(), &mut payload);
        self.process_plain(FrameType::Register, &payload)?;
        info!(username = %self.username, "account registered");
        Ok(())
    }

    /// Legacy registration stores the Argon2id-stretched key server-side
    /// (the password itself never leaves the client, but the stretched key
    /// is password-equivalent — one of the reasons this mode is
    /// discouraged in favour of OPAQUE).
    fn register_legacy(&mut self, password: &str) -> Result<(), ClientError> {
        let salt = mi_crypto::kdf::generate_salt();
        let stretched = Zeroizing::new(mi_crypto::kdf::argon2id_derive(
            password.as_bytes(),
            &salt,
            REGISTER_ARGON_MEMORY_KIB,
            REGISTER_ARGON_PASSES,
        )?);

        let mut payload = Vec::new();
        wire::write_u8(REGISTER_SUB_START, &mut payload);
        wire::write_string(&self.username, &mut payload)?;
        payload.extend_from_slice(&salt);
        wire::write_u32(REGISTER_ARGON_MEMORY_KIB, &mut payload);
        wire::write_u32(REGISTER_ARGON_PASSES, &mut payload);
        wire::write_arr32(&stretched, &mut payload);
        wire::write_arr32(self.identity.sign_public(), &mut payload);
        wire::write_arr32(self.identity.dh_public(), &mut payload);
        self.process_plain(FrameType::Register, &payload)?;
        info!(username = %self.username, "account registered (legacy)");
        Ok(())
    }

    /// Authenticate and derive the session channel.
    pub fn login(&mut self, password: &str) -> Result<(), ClientError> {
        if password.is_empty() {
            return Err(ClientError::InvalidInput("password empty".into()));
        }
        let (secret, token): (Zeroizing<Vec<u8>>, String) = match self.config.auth_mode {
            AuthMode::Opaque => self.login_opaque(password)?,
            AuthMode::Legacy => {
                let (secret, token) = self.login_legacy(password)?;
                (Zeroizing::new(secret.to_vec()), token)
            }
        };

        let channel = SecureChannel::derive(
            &secret,
            &self.username,
            &token,
            self.transport.kind(),
            true,
        )?;
        self.channel = Some(channel);
        self.session_token = Some(token);
        info!(username = %self.username, "session established");
        Ok(())
    }

    fn login_opaque(
        &mut self,
        password: &str,
    ) -> Result<(Zeroizing<Vec<u8>>, String), ClientError> {
        let (state, request) = opaque::login_start(password)?;

        let mut payload = Vec::new();
        wire::write_string(&self.username, &mut payload)?;
        wire::write_bytes(&request, &mut payload)?;
        let response = self.process_plain(FrameType::OpaqueStart, &payload)?;
        let mut r = Reader::new(&response);
        let credential_response = r.read_bytes()?;
        r.finish()?;

        let (finalization, session_key) =
            opaque::login_finish(&state, password, &credential_response)?;

        let mut payload = Vec::new();
        wire::write_string(&self.username, &mut payload)?;
        wire::write_bytes(&finalization, &mut payload)?;
        let response = self.process_plain(FrameType::OpaqueFinish, &payload)?;
        let mut r = Reader::new(&response);
        let token = r.read_string()?;
        r.finish()?;
        Ok((session_key, token))
    }

    fn login_legacy(
        &mut self,
        password: &str,
    ) -> Result<(Zeroizing<[u8; 32]>, String), ClientError> {
        let (mut client, hello) = LegacyClient::start(&self.username)?;
        let response = self.process_plain(FrameType::HelloLegacy, &hello)?;
        let hello_response = LegacyHelloResponse::decode(&response)?;

        let proof_request = client.process_hello_response(password, &hello_response)?;
        let response = self.process_plain(FrameType::ProofLegacy, &proof_request)?;
        let mut r = Reader::new(&response);
        let server_proof = r.read_bytes()?;
        r.finish()?;
        client.verify_server_proof(&server_proof)?;

        let mut payload = Vec::new();
        wire::write_bytes(&client.client_proof()?, &mut payload)?;
        self.process_plain(FrameType::Login, &payload)?;

        client.into_secret()
    }

    /// Re-authenticate after a dropped connection; the account credentials
    /// are unchanged, the handshake and channel keys are fresh.
    pub fn relogin(&mut self, password: &str) -> Result<(), ClientError> {
        self.channel = None;
        self.session_token = None;
        self.transport.reset();
        self.login(password)
    }

    /// Best-effort: the session is invalid client-side no matter what the
    /// relay answers. All in-memory secret state is dropped (and thereby
    /// zeroised).
    pub fn logout(&mut self) -> Result<(), ClientError> {
        if self.channel.is_some() {
            if let Err(e) = self.process_encrypted(FrameType::Logout, &[]) {
                debug!(error = %e, "logout round-trip failed; proceeding");
            }
        }
        self.channel = None;
        self.session_token = None;
        self.pairwise.clear();
        self.groups.clear();
        self.pairing.cancel();
        self.distribution_msg_ids.clear();
        Ok(())
    }

    pub fn heartbeat(&mut self) -> Result<(), ClientError> {
        // Padded so a heartbeat is indistinguishable from small traffic.
        let payload = mi_proto::padding::pad(&[]);
        self.process_encrypted(FrameType::Heartbeat, &payload)?;
        Ok(())
    }

    pub fn list_devices(&mut self) -> Result<Vec<DeviceInfo>, ClientError> {
        let response = self.process_encrypted(FrameType::ListDevices, &[])?;
        let mut r = Reader::new(&response);
        let count = r.read_u32()? as usize;
        let mut devices = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            devices.push(DeviceInfo {
                device_id: r.read_string()?,
                device_name: r.read_string()?,
                last_seen: r.read_u64()?,
            });
        }
        r.finish()?;
        Ok(devices)
    }

    /// Evict a device. On the primary this also rotates the device-sync
    /// key: the rotation event goes out under the CURRENT key, then the
    /// stored key flips, so the evicted device cannot read anything newer.
    pub fn kick_device(&mut self, device_id: &str) -> Result<(), ClientError> {
        if device_id.is_empty() {
            return Err(ClientError::InvalidInput("device id empty".into()));
        }
        if device_id == self.device_id {
            return Err(ClientError::InvalidInput("cannot kick this device".into()));
        }
        let mut payload = Vec::new();
        wire::write_string(device_id, &mut payload)?;
        self.process_encrypted(FrameType::KickDevice, &payload)?;

        if self.config.device_sync_enabled && self.config.device_sync_primary {
            self.rotate_device_sync_key()?;
        }
        Ok(())
    }

    pub(crate) fn rotate_device_sync_key(&mut self) -> Result<(), ClientError> {
        let Some(current) = &self.sync_key else {
            return Err(ClientError::InvalidInput("device sync key missing".into()));
        };
        let next = DeviceSyncKey::generate();
        let event = SyncEvent::RotateKey {
            new_key: *next.as_bytes(),
        };
        // Broadcast under the current key first; only then swap on disk.
        let cipher = mi_proto::sync_event::seal(current.as_bytes(), &event)?;
        let mut payload = Vec::new();
        wire::write_string(&self.device_id, &mut payload)?;
        wire::write_bytes(&cipher, &mut payload)?;
        self.process_encrypted(FrameType::DeviceSyncPush, &payload)?;

        self.store.store_device_sync_key(&next)?;
        if let Some(key) = &mut self.sync_key {
            key.rotate_to(next);
        }
        info!("device sync key rotated");
        Ok(())
    }
}
