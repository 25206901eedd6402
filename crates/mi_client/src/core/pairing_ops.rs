//! Device pairing over the relay.
//!
//! The relay sees only the pairing id (a hash) and sealed payloads; the
//! pairing key never leaves the two devices. The linked device drains any
//! queued sync ciphertexts before posting its request so backlog sealed
//! under the old key cannot be replayed to it afterwards.

use tracing::debug;

use mi_proto::frame::FrameType;
use mi_proto::pairing;
use mi_proto::sync_event::{HistoryEntry, SyncEvent};
use mi_proto::wire;
use mi_sync::key::DeviceSyncKey;

use crate::core::{parse_blob_list, ClientCore};
use crate::error::ClientError;

/// Pull-mode bytes on `DevicePairingPull`.
const PULL_REQUESTS: u8 = 0;
const PULL_RESPONSES: u8 = 1;

/// Upper bound on the history window mirrored to a fresh device.
pub const HISTORY_SNAPSHOT_MAX: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequestInfo {
    pub device_id: String,
    pub request_id_hex: String,
}

impl ClientCore {
    /// Primary side: mint the code, publish the pairing id, show the code
    /// out of band.
    pub fn begin_pairing_primary(&mut self) -> Result<String, ClientError> {
        if self.channel.is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        if !self.config.device_sync_enabled {
            return Err(ClientError::InvalidInput("device sync disabled".into()));
        }
        if !self.config.device_sync_primary {
            return Err(ClientError::InvalidInput("not the primary device".into()));
        }
        if self.sync_key.is_none() {
            return Err(ClientError::InvalidInput("device sync key missing".into()));
        }

        let code = self.pairing.begin_primary()?;
        let mut payload = Vec::new();
        wire::write_string(&self.pairing.pairing_id, &mut payload)?;
        if let Err(e) = self.process_encrypted(FrameType::DevicePairingPublish, &payload) {
            self.pairing.cancel();
            return Err(e);
        }
        Ok(code)
    }

    /// Primary side: decrypt pending requests; garbage, self-addressed, and
    /// duplicate entries are skipped silently.
    pub fn poll_pairing_requests(&mut self) -> Result<Vec<PairingRequestInfo>, ClientError> {
        if !self.pairing.primary_ready() {
            return Err(ClientError::InvalidInput("pairing not active".into()));
        }
        let mut payload = Vec::new();
        wire::write_u8(PULL_REQUESTS, &mut payload);
        wire::write_string(&self.pairing.pairing_id, &mut payload)?;
        let response = self.process_encrypted(FrameType::DevicePairingPull, &payload)?;
        let ciphertexts = parse_blob_list(&response)?;

        let key = *self.pairing.key()?;
        let mut out: Vec<PairingRequestInfo> = Vec::new();
        for cipher in ciphertexts {
            let Ok(plain) = pairing::decrypt_payload(&key, &cipher) else {
                continue;
            };
            let Ok((device_id, request_id)) = pairing::decode_request(&plain) else {
                continue;
            };
            if device_id.is_empty() || device_id == self.device_id {
                continue;
            }
            let request_id_hex = hex::encode(request_id);
            if out.iter().any(|r| r.request_id_hex == request_id_hex) {
                continue;
            }
            out.push(PairingRequestInfo {
                device_id,
                request_id_hex,
            });
        }
        Ok(out)
    }

    /// Primary side: the user approved a request; seal the device-sync key
    /// back to the requester, best-effort a history snapshot, clear state.
    pub fn approve_pairing_request(
        &mut self,
        request: &PairingRequestInfo,
        recent_history: Vec<HistoryEntry>,
    ) -> Result<(), ClientError> {
        if !self.pairing.primary_ready() {
            return Err(ClientError::InvalidInput("pairing not active".into()));
        }
        if request.device_id.is_empty() || request.request_id_hex.is_empty() {
            return Err(ClientError::InvalidInput("invalid pairing request".into()));
        }
        let request_id: [u8; 16] = hex::decode(&request.request_id_hex)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ClientError::InvalidInput("invalid request id".into()))?;
        let sync_key = *self
            .sync_key
            .as_ref()
            .ok_or_else(|| ClientError::InvalidInput("device sync key missing".into()))?
            .as_bytes();

        let plain = pairing::encode_response(&request_id, &sync_key)?;
        let key = *self.pairing.key()?;
        let cipher = pairing::encrypt_payload(&key, &plain)?;

        let mut payload = Vec::new();
        wire::write_string(&self.pairing.pairing_id, &mut payload)?;
        wire::write_string(&request.device_id, &mut payload)?;
        wire::write_bytes(&cipher, &mut payload)?;
        self.process_encrypted(FrameType::DevicePairingRespond, &payload)?;

        // Hand the fresh device a bounded recent window; failure here must
        // not fail the pairing.
        let mut entries = recent_history;
        entries.truncate(HISTORY_SNAPSHOT_MAX);
        if !entries.is_empty() {
            self.sync_push_best_effort(&SyncEvent::HistorySnapshot { entries });
        }

        self.pairing.cancel();
        Ok(())
    }

    /// Linked side: derive from the typed code and post the request.
    pub fn begin_pairing_linked(&mut self, code: &str) -> Result<(), ClientError> {
        if self.channel.is_none() {
            return Err(ClientError::NotAuthenticated);
        }
        if !self.config.device_sync_enabled {
            return Err(ClientError::InvalidInput("device sync disabled".into()));
        }
        if self.sync_key.is_some() {
            return Err(ClientError::InvalidInput(
                "device sync key already present".into(),
            ));
        }
        if code.trim().is_empty() {
            return Err(ClientError::InvalidInput("pairing code empty".into()));
        }

        // Drain queued ciphertexts addressed to us before the key arrives;
        // they predate this pairing and must not replay into it.
        let mut drain = Vec::new();
        if wire::write_string(&self.device_id, &mut drain).is_ok() {
            if let Err(e) = self.process_encrypted(FrameType::DeviceSyncPull, &drain) {
                debug!(error = %e, "pre-pairing sync drain skipped");
            }
        }

        self.pairing.begin_linked(code)?;
        let request =
            pairing::encode_request(&self.device_id, self.pairing.request_id())?;
        let key = *self.pairing.key()?;
        let cipher = pairing::encrypt_payload(&key, &request)?;

        let mut payload = Vec::new();
        wire::write_string(&self.pairing.pairing_id, &mut payload)?;
        wire::write_bytes(&cipher, &mut payload)?;
        if let Err(e) = self.process_encrypted(FrameType::DevicePairingRequest, &payload) {
            self.pairing.cancel();
            return Err(e);
        }
        Ok(())
    }

    /// Linked side: poll for the sealed response. True once the sync key is
    /// installed and pairing state cleared.
    pub fn poll_pairing_linked(&mut self) -> Result<bool, ClientError> {
        if !self.pairing.linked_pending() {
            return Err(ClientError::InvalidInput("pairing not pending".into()));
        }
        let mut payload = Vec::new();
        wire::write_u8(PULL_RESPONSES, &mut payload);
        wire::write_string(&self.pairing.pairing_id, &mut payload)?;
        wire::write_string(&self.device_id, &mut payload)?;
        let response = self.process_encrypted(FrameType::DevicePairingPull, &payload)?;
        let ciphertexts = parse_blob_list(&response)?;

        let key = *self.pairing.key()?;
        let expected_request = *self.pairing.request_id();
        for cipher in ciphertexts {
            let Ok(plain) = pairing::decrypt_payload(&key, &cipher) else {
                continue;
            };
            let Ok((request_id, sync_key)) = pairing::decode_response(&plain) else {
                continue;
            };
            if request_id != expected_request {
                continue;
            }
            let sync_key = DeviceSyncKey::from_bytes(&sync_key)?;
            self.store.store_device_sync_key(&sync_key)?;
            self.sync_key = Some(sync_key);
            self.pairing.cancel();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn cancel_pairing(&mut self) {
        self.pairing.cancel();
    }
}
