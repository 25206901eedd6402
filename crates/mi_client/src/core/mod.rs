//! The orchestrator.
//!
//! `ClientCore` is the blocking, single-threaded request/response surface.
//! It owns every engine and all persisted state; operations run to
//! completion on the caller's thread and roll back partial mutations on
//! error (resumable blob transfers excepted, by design).

mod blob_ops;
mod chat;
mod friends;
mod media;
mod pairing_ops;
mod poll;
mod prekey_ops;
mod session;

pub use chat::{RICH_KIND_CONTACT_CARD, RICH_KIND_LOCATION};
pub use friends::{FriendDelta, GroupMemberInfo, ROLE_ADMIN, ROLE_MEMBER};
pub use media::{GroupCallEvent, CALL_EVENT_JOINED, CALL_EVENT_LEFT};
pub use pairing_ops::{PairingRequestInfo, HISTORY_SNAPSHOT_MAX};
pub use session::DeviceInfo;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use mi_crypto::identity::IdentityKeyset;
use mi_e2ee::group::GroupEngine;
use mi_e2ee::prekeys::PreKeyStore;
use mi_e2ee::PairwiseEngine;
use mi_kt::{KtClient, KtPolicy};
use mi_proto::frame::{self, FrameType};
use mi_proto::wire::{self, Reader};
use mi_sync::key::DeviceSyncKey;
use mi_sync::PairingState;
use mi_transport::kcp::{KcpConfig, KcpTransport};
use mi_transport::tcp::TcpTransport;
use mi_transport::tls::TlsTransport;
use mi_transport::Transport;

use crate::channel::SecureChannel;
use crate::config::{ClientConfig, TransportChoice};
use crate::cover::CoverTraffic;
use crate::dedup::DedupSet;
use crate::error::ClientError;
use crate::store::{trust, ExclusiveLock, StateStore};

/// KT-verified identity for a peer; what group signatures verify against.
#[derive(Debug, Clone, Copy)]
pub struct PeerIdentity {
    pub sign_public: [u8; 32],
    pub dh_public: [u8; 32],
}

pub struct ClientCore {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) store: StateStore,
    _lock: ExclusiveLock,

    pub(crate) username: String,
    pub(crate) identity: IdentityKeyset,
    pub(crate) prekeys: PreKeyStore,
    pub(crate) pairwise: PairwiseEngine,
    pub(crate) groups: GroupEngine,
    pub(crate) kt: KtClient,

    pub(crate) channel: Option<SecureChannel>,
    pub(crate) session_token: Option<String>,

    pub(crate) device_id: String,
    pub(crate) sync_key: Option<DeviceSyncKey>,
    pub(crate) pairing: PairingState,

    pub(crate) dedup: DedupSet,
    pub(crate) cover: CoverTraffic,

    /// KT-verified identities by username.
    pub(crate) known_identities: HashMap<String, PeerIdentity>,
    /// msg_id of an in-flight sender-key distribution → group id.
    pub(crate) distribution_msg_ids: HashMap<[u8; 16], String>,
}

impl ClientCore {
    /// Open state, acquire the single-instance lock, and build the
    /// configured transport (consulting the trust store for pins and
    /// downgrade refusal).
    pub fn new(config: ClientConfig, username: &str) -> Result<Self, ClientError> {
        config.validate().map_err(ClientError::InvalidInput)?;
        let store = StateStore::open(&config.data_dir, username)?;
        let transport = build_transport(&config, &store, username)?;
        Self::with_transport(config, username, store, transport)
    }

    /// Same as [`ClientCore::new`] with an injected transport (tests, or an
    /// embedder carrying its own tunnel).
    pub fn with_transport(
        config: ClientConfig,
        username: &str,
        store: StateStore,
        transport: Box<dyn Transport>,
    ) -> Result<Self, ClientError> {
        config.validate().map_err(ClientError::InvalidInput)?;
        if username.is_empty() {
            return Err(ClientError::InvalidInput("username empty".into()));
        }
        let lock = ExclusiveLock::acquire(&store.lock_path())?;

        let identity = store.load_or_create_identity()?;
        let prekeys = match store.load_prekeys()? {
            Some(prekeys) => prekeys,
            None => {
                let prekeys = PreKeyStore::generate(&identity, now_unix());
                store.store_prekeys(&prekeys)?;
                prekeys
            }
        };
        let peer_trust = store.load_peer_trust()?;
        let mut pairwise = PairwiseEngine::new(username.to_string(), peer_trust);
        for session in store.load_sessions()? {
            pairwise.insert_session(session);
        }

        let kt = KtClient::new(
            KtPolicy {
                require_sth_signature: config.kt_require_sth_signature,
                mismatch_alert_threshold: config.kt_mismatch_alert_threshold,
            },
            config.kt_sth_public,
            store.load_kt_snapshot()?,
        );

        let device_id = store.load_or_create_device_id()?;
        let sync_key = if config.device_sync_enabled {
            match store.load_device_sync_key()? {
                Some(key) => Some(key),
                None if config.device_sync_primary => {
                    let key = DeviceSyncKey::generate();
                    store.store_device_sync_key(&key)?;
                    Some(key)
                }
                // A linked device gets the key through pairing.
                None => None,
            }
        } else {
            None
        };

        let cover = CoverTraffic::new(config.cover_traffic, config.cover_traffic_interval_secs);
        debug!(username, device_id = %device_id, "client core ready");

        Ok(Self {
            config,
            transport,
            store,
            _lock: lock,
            username: username.to_string(),
            identity,
            prekeys,
            pairwise,
            groups: GroupEngine::new(),
            kt,
            channel: None,
            session_token: None,
            device_id,
            sync_key,
            pairing: PairingState::default(),
            dedup: DedupSet::default(),
            cover,
            known_identities: HashMap::new(),
            distribution_msg_ids: HashMap::new(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.channel.is_some()
    }

    /// Our own identity SAS for out-of-band comparison.
    pub fn own_sas(&self) -> String {
        mi_crypto::identity::sas_string(&self.identity.fingerprint())
    }

    /// KT alert state (latched until acknowledged).
    pub fn kt_alert(&self) -> bool {
        self.kt.alert()
    }

    pub fn acknowledge_kt_alert(&mut self) {
        self.kt.acknowledge_alert();
    }

    // ── Request plumbing ─────────────────────────────────────────────────

    /// Unsealed round trip, only for pre-session handshake frames.
    pub(crate) fn process_plain(
        &mut self,
        ftype: FrameType,
        payload: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let request = frame::encode_frame(ftype, payload)?;
        let response = self.transport.round_trip(&request)?;
        let (rtype, rpayload) = match frame::decode_frame(&response) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.transport.reset();
                return Err(e.into());
            }
        };
        if rtype != ftype {
            self.transport.reset();
            return Err(ClientError::ProtocolInvalid(format!(
                "response type {rtype:?} for request {ftype:?}"
            )));
        }
        parse_status(rpayload)
    }

    /// Sealed round trip on the session channel.
    pub(crate) fn process_encrypted(
        &mut self,
        ftype: FrameType,
        payload: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let token = self.session_token.clone().ok_or(ClientError::NotAuthenticated)?;
        let channel = self.channel.as_mut().ok_or(ClientError::NotAuthenticated)?;

        let cipher = channel.seal(ftype, payload)?;
        let sealed = frame::encode_sealed_payload(&token, &cipher)?;
        let request = frame::encode_frame(ftype, &sealed)?;

        let response = self.transport.round_trip(&request)?;
        let (rtype, rpayload) = match frame::decode_frame(&response) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.transport.reset();
                return Err(e.into());
            }
        };
        if rtype != ftype {
            self.transport.reset();
            return Err(ClientError::ProtocolInvalid(format!(
                "response type {rtype:?} for request {ftype:?}"
            )));
        }
        let (rtoken, rcipher) = frame::decode_sealed_payload(rpayload)?;
        if rtoken != token {
            // The relay answered for a different session: ours is gone.
            warn!("session token mismatch; invalidating session");
            self.channel = None;
            self.session_token = None;
            return Err(ClientError::TrustViolation("session token mismatch".into()));
        }
        let channel = self.channel.as_mut().expect("checked above");
        let plain = channel.open(ftype, &rcipher)?;
        parse_status(&plain)
    }

    /// Push a sync event to sibling devices; failures are logged, never
    /// fatal to the calling operation.
    pub(crate) fn sync_push_best_effort(&mut self, event: &mi_proto::sync_event::SyncEvent) {
        if let Err(e) = self.sync_push(event) {
            debug!(error = %e, "device sync push skipped");
        }
    }

    pub(crate) fn sync_push(
        &mut self,
        event: &mi_proto::sync_event::SyncEvent,
    ) -> Result<(), ClientError> {
        if !self.config.device_sync_enabled {
            return Ok(());
        }
        let Some(key) = &self.sync_key else {
            return Err(ClientError::InvalidInput("device sync key missing".into()));
        };
        let cipher = mi_proto::sync_event::seal(key.as_bytes(), event)?;
        let mut payload = Vec::with_capacity(2 + self.device_id.len() + 4 + cipher.len());
        wire::write_string(&self.device_id, &mut payload)?;
        wire::write_bytes(&cipher, &mut payload)?;
        self.process_encrypted(FrameType::DeviceSyncPush, &payload)?;
        Ok(())
    }
}

/// Response payload convention: `u8 status` then either the result fields
/// (status 1) or a `string` error forwarded verbatim (status 0).
pub(crate) fn parse_status(payload: &[u8]) -> Result<Vec<u8>, ClientError> {
    let mut r = Reader::new(payload);
    let status = r.read_u8()?;
    if status == 0 {
        let message = r.read_string().unwrap_or_default();
        return Err(ClientError::Server(if message.is_empty() {
            "request failed".into()
        } else {
            message
        }));
    }
    if status != 1 {
        return Err(ClientError::ProtocolInvalid(format!(
            "unknown status byte {status}"
        )));
    }
    Ok(payload[1..].to_vec())
}

/// Count-prefixed list of byte blobs, the relay's standard pull shape.
pub(crate) fn parse_blob_list(payload: &[u8]) -> Result<Vec<Vec<u8>>, ClientError> {
    let mut r = Reader::new(payload);
    let count = r.read_u32()? as usize;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        out.push(r.read_bytes()?);
    }
    r.finish()?;
    Ok(out)
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn random_id16() -> [u8; 16] {
    use rand::RngCore;
    let mut id = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

fn build_transport(
    config: &ClientConfig,
    store: &StateStore,
    username: &str,
) -> Result<Box<dyn Transport>, ClientError> {
    let endpoint = config.endpoint();
    let entry = trust::load_entry(username, &store.trust_store_path(), &endpoint.key())?;

    match config.transport {
        TransportChoice::Tcp => {
            // Downgrade detection: a pinned endpoint demanding TLS refuses
            // plaintext outright.
            if entry.as_ref().map(|e| e.tls_required).unwrap_or(false) {
                return Err(ClientError::TrustViolation(
                    "trust store requires TLS for this endpoint".into(),
                ));
            }
            Ok(Box::new(TcpTransport::new(endpoint, config.proxy())))
        }
        TransportChoice::Tls => {
            let entry = entry.ok_or_else(|| {
                ClientError::TrustViolation(
                    "no pinned certificate for this endpoint; confirm the SAS first".into(),
                )
            })?;
            Ok(Box::new(TlsTransport::new(endpoint, entry.fingerprint)))
        }
        TransportChoice::Kcp => {
            if entry.as_ref().map(|e| e.tls_required).unwrap_or(false) {
                return Err(ClientError::TrustViolation(
                    "trust store requires TLS for this endpoint".into(),
                ));
            }
            Ok(Box::new(KcpTransport::new(endpoint, KcpConfig::default())))
        }
    }
}

/// First-contact pinning: probe the server certificate and return the SAS
/// the user must compare before [`confirm_server_pin`] stores it.
pub fn probe_server_sas(config: &ClientConfig) -> Result<(String, String), ClientError> {
    let fingerprint = mi_transport::tls::probe_fingerprint(&config.endpoint())?;
    let sas = mi_crypto::identity::sas_for_hex_fingerprint(&fingerprint)?;
    Ok((fingerprint, sas))
}

/// Store a human-confirmed pin for the configured endpoint.
pub fn confirm_server_pin(
    config: &ClientConfig,
    username: &str,
    fingerprint_hex: &str,
    tls_required: bool,
) -> Result<(), ClientError> {
    let store = StateStore::open(&config.data_dir, username)?;
    trust::store_entry(
        username,
        &store.trust_store_path(),
        &config.endpoint().key(),
        &trust::TrustEntry {
            fingerprint: fingerprint_hex.to_ascii_lowercase(),
            tls_required,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status(&[1, 9, 9]).unwrap(), vec![9, 9]);
        let mut err_payload = vec![0u8];
        wire::write_string("nope", &mut err_payload).unwrap();
        match parse_status(&err_payload) {
            Err(ClientError::Server(msg)) => assert_eq!(msg, "nope"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_status(&[7]).is_err());
        assert!(parse_status(&[]).is_err());
    }

    #[test]
    fn blob_list_parsing() {
        let mut payload = Vec::new();
        wire::write_u32(2, &mut payload);
        wire::write_bytes(b"one", &mut payload).unwrap();
        wire::write_bytes(b"two", &mut payload).unwrap();
        let blobs = parse_blob_list(&payload).unwrap();
        assert_eq!(blobs, vec![b"one".to_vec(), b"two".to_vec()]);

        payload.push(0);
        assert!(parse_blob_list(&payload).is_err());
    }
}
