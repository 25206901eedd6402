//! End-to-end tests against an in-memory relay.
//!
//! The relay below speaks the real frame protocol: legacy handshake,
//! sealed session channel with counters, KT-proofed bundle fetches, message
//! queues, group fan-out, device sync, and pairing boxes. It trusts nothing
//! it cannot parse and signs its own key-transparency log.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use mi_client::channel::SecureChannel;
use mi_client::config::{AuthMode, ClientConfig, CoverTrafficMode, TransportChoice};
use mi_client::core::ClientCore;
use mi_client::handshake::{
    legacy_secret_from_parts, proof_mac, transcript_hash, LegacyHelloResponse, CLIENT_PROOF_TAG,
    SERVER_PROOF_TAG,
};
use mi_client::store::StateStore;
use mi_client::ChatEvent;

use mi_crypto::identity::IdentityKeyset;
use mi_crypto::kem;
use mi_kt::merkle::{leaf_hash, node_hash};
use mi_kt::sth::sth_transcript;
use mi_proto::frame::{self, FrameType};
use mi_proto::kt_wire::KtProofBundle;
use mi_proto::wire::{self, Reader};
use mi_transport::{Transport, TransportError, TransportKind};

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

// ── Reference KT log ─────────────────────────────────────────────────────────

#[derive(Default)]
struct KtLog {
    leaves: Vec<[u8; 32]>,
    index_by_user: HashMap<String, usize>,
}

impl KtLog {
    fn upsert(&mut self, username: &str, sign_public: &[u8; 32], dh_public: &[u8; 32]) {
        let leaf = leaf_hash(username, sign_public, dh_public);
        match self.index_by_user.get(username) {
            // The log is append-only; an unchanged identity keeps its leaf.
            Some(_) => {}
            None => {
                self.index_by_user
                    .insert(username.to_string(), self.leaves.len());
                self.leaves.push(leaf);
            }
        }
    }

    fn size(&self) -> usize {
        self.leaves.len()
    }

    fn root_of(&self, lo: usize, hi: usize) -> [u8; 32] {
        if hi - lo == 1 {
            return self.leaves[lo];
        }
        let k = largest_pow2_lt(hi - lo);
        node_hash(&self.root_of(lo, lo + k), &self.root_of(lo + k, hi))
    }

    fn root(&self) -> [u8; 32] {
        self.root_of(0, self.size())
    }

    fn audit_path(&self, index: usize) -> Vec<[u8; 32]> {
        self.audit_in(index, 0, self.size())
    }

    fn audit_in(&self, index: usize, lo: usize, hi: usize) -> Vec<[u8; 32]> {
        if hi - lo == 1 {
            return Vec::new();
        }
        let k = largest_pow2_lt(hi - lo);
        if index - lo < k {
            let mut path = self.audit_in(index, lo, lo + k);
            path.push(self.root_of(lo + k, hi));
            path
        } else {
            let mut path = self.audit_in(index, lo + k, hi);
            path.push(self.root_of(lo, lo + k));
            path
        }
    }

    fn consistency(&self, old: usize) -> Vec<[u8; 32]> {
        if old == 0 || old >= self.size() {
            return Vec::new();
        }
        self.subproof(old, 0, self.size(), true)
    }

    fn subproof(&self, m: usize, lo: usize, hi: usize, complete: bool) -> Vec<[u8; 32]> {
        let n = hi - lo;
        if m == n {
            if complete {
                return Vec::new();
            }
            return vec![self.root_of(lo, hi)];
        }
        let k = largest_pow2_lt(n);
        if m <= k {
            let mut proof = self.subproof(m, lo, lo + k, complete);
            proof.push(self.root_of(lo + k, hi));
            proof
        } else {
            let mut proof = self.subproof(m - k, lo + k, hi, false);
            proof.push(self.root_of(lo, lo + k));
            proof
        }
    }
}

fn largest_pow2_lt(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

// ── The relay ────────────────────────────────────────────────────────────────

struct UserRecord {
    salt: [u8; 16],
    memory_kib: u32,
    passes: u32,
    stretched: [u8; 32],
}

struct PendingHandshake {
    username: String,
    client_nonce: [u8; 32],
    client_dh: [u8; 32],
    server_dh_secret: StaticSecret,
    kem_secret: kem::KemSecretKey,
    hello: LegacyHelloResponse,
    secret: Option<[u8; 32]>,
    transcript: Option<[u8; 32]>,
}

struct ServerSession {
    username: String,
    channel: SecureChannel,
}

#[derive(Default)]
struct PairingBox {
    requests: Vec<Vec<u8>>,
    responses: HashMap<String, Vec<Vec<u8>>>,
}

/// Published prekey material: the base bundle plus the one-time pool the
/// relay hands out one entry per fetch.
struct PublishedKeys {
    base_bundle: Vec<u8>,
    one_time_pool: Vec<(u32, [u8; 32])>,
    next: usize,
}

struct SyncMessage {
    username: String,
    from_device: String,
    cipher: Vec<u8>,
    delivered_to: HashSet<String>,
}

#[derive(Default)]
struct Relay {
    users: HashMap<String, UserRecord>,
    pending: HashMap<String, PendingHandshake>,
    sessions: HashMap<String, ServerSession>,
    token_counter: u64,

    kt: KtLog,
    sth_signer: Option<IdentityKeyset>,
    bundles: HashMap<String, PublishedKeys>,

    e2ee_queues: HashMap<String, Vec<Vec<u8>>>,
    group_queues: HashMap<String, Vec<Vec<u8>>>,
    groups: HashMap<String, Vec<String>>,
    notice_queues: HashMap<String, Vec<(String, u8, String, String, u8)>>,

    sync_messages: Vec<SyncMessage>,
    pairing_boxes: HashMap<String, PairingBox>,
}

impl Relay {
    fn new() -> Self {
        Self {
            sth_signer: Some(IdentityKeyset::generate()),
            ..Default::default()
        }
    }

    fn sth_public(&self) -> [u8; 32] {
        *self.sth_signer.as_ref().unwrap().sign_public()
    }

    fn ok(fields: &[u8]) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend_from_slice(fields);
        out
    }

    fn err(message: &str) -> Vec<u8> {
        let mut out = vec![0u8];
        wire::write_string(message, &mut out).unwrap();
        out
    }

    fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        let (ftype, payload) = frame::decode_frame(request).expect("client sends valid frames");
        let response = match ftype {
            FrameType::Register => {
                self.handle_register(payload);
                Self::ok(&[])
            }
            FrameType::HelloLegacy => self.handle_hello(payload),
            FrameType::ProofLegacy => self.handle_proof(payload),
            FrameType::Login => self.handle_login_finish(payload),
            _ => self.handle_sealed(ftype, payload),
        };
        frame::encode_frame(ftype, &response).unwrap()
    }

    fn handle_register(&mut self, payload: &[u8]) {
        let mut r = Reader::new(payload);
        let sub = r.read_u8().unwrap();
        assert_eq!(sub, 1, "test relay only implements legacy registration");
        let username = r.read_string().unwrap();
        let salt: [u8; 16] = r.take(16).unwrap().try_into().unwrap();
        let memory_kib = r.read_u32().unwrap();
        let passes = r.read_u32().unwrap();
        let stretched = r.read_arr32().unwrap();
        let sign_public = r.read_arr32().unwrap();
        let dh_public = r.read_arr32().unwrap();
        r.finish().unwrap();

        self.users.insert(
            username.clone(),
            UserRecord {
                salt,
                memory_kib,
                passes,
                stretched,
            },
        );
        self.kt.upsert(&username, &sign_public, &dh_public);
    }

    fn handle_hello(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut r = Reader::new(payload);
        let username = r.read_string().unwrap();
        let client_nonce = r.read_arr32().unwrap();
        let client_dh = r.read_arr32().unwrap();
        r.finish().unwrap();

        let Some(user) = self.users.get(&username) else {
            return Self::err("unknown user");
        };
        let server_dh_secret = StaticSecret::random_from_rng(OsRng);
        let (kem_public, kem_secret) = kem::keypair();
        let mut server_nonce = [0u8; 32];
        OsRng.fill_bytes(&mut server_nonce);
        self.token_counter += 1;
        let hello = LegacyHelloResponse {
            salt: user.salt,
            argon_memory_kib: user.memory_kib,
            argon_passes: user.passes,
            server_nonce,
            server_dh_public: X25519Public::from(&server_dh_secret).to_bytes(),
            kem_public: kem_public.as_bytes().to_vec(),
            session_token: format!("sess-{}-{}", username, self.token_counter),
        };
        let encoded = hello.encode().unwrap();
        self.pending.insert(
            username.clone(),
            PendingHandshake {
                username,
                client_nonce,
                client_dh,
                server_dh_secret,
                kem_secret,
                hello,
                secret: None,
                transcript: None,
            },
        );
        Self::ok(&encoded)
    }

    fn handle_proof(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut r = Reader::new(payload);
        let kem_ct = r.read_bytes().unwrap();
        r.finish().unwrap();

        // single-client-per-round test relay: find the pending handshake
        // whose kem decapsulation works out
        let usernames: Vec<String> = self.pending.keys().cloned().collect();
        for username in usernames {
            let pending = self.pending.get_mut(&username).unwrap();
            let Ok(ct) = kem::KemCiphertext::from_bytes(&kem_ct) else {
                continue;
            };
            let Ok(kem_shared) = kem::decapsulate(&ct, &pending.kem_secret) else {
                continue;
            };
            let dh_shared = pending
                .server_dh_secret
                .diffie_hellman(&X25519Public::from(pending.client_dh));
            let transcript = transcript_hash(
                &pending.client_nonce,
                &pending.hello.server_nonce,
                &pending.client_dh,
                &pending.hello.server_dh_public,
                &kem_ct,
            );
            let user = self.users.get(&pending.username).unwrap();
            let secret = legacy_secret_from_parts(
                &user.stretched,
                dh_shared.as_bytes(),
                &kem_shared,
                &transcript,
            )
            .unwrap();
            pending.secret = Some(*secret);
            pending.transcript = Some(transcript);
            let server_proof = proof_mac(&secret, SERVER_PROOF_TAG, &transcript);
            let mut fields = Vec::new();
            wire::write_bytes(&server_proof, &mut fields).unwrap();
            return Self::ok(&fields);
        }
        Self::err("no pending handshake")
    }

    fn handle_login_finish(&mut self, payload: &[u8]) -> Vec<u8> {
        let mut r = Reader::new(payload);
        let client_proof = r.read_bytes().unwrap();
        r.finish().unwrap();

        let usernames: Vec<String> = self.pending.keys().cloned().collect();
        for username in usernames {
            let pending = self.pending.get(&username).unwrap();
            let Some(secret) = pending.secret else { continue };
            let Some(transcript) = pending.transcript else { continue };
            let expected = proof_mac(&secret, CLIENT_PROOF_TAG, &transcript);
            if expected.as_slice() != client_proof.as_slice() {
                continue;
            }
            let token = pending.hello.session_token.clone();
            let channel =
                SecureChannel::derive(&secret, &username, &token, TransportKind::Tcp, false)
                    .unwrap();
            self.sessions.insert(
                token,
                ServerSession {
                    username: username.clone(),
                    channel,
                },
            );
            self.pending.remove(&username);
            return Self::ok(&[]);
        }
        Self::err("client proof invalid")
    }

    fn handle_sealed(&mut self, ftype: FrameType, payload: &[u8]) -> Vec<u8> {
        let Ok((token, cipher)) = frame::decode_sealed_payload(payload) else {
            return Self::err("sealed payload invalid");
        };
        let Some(session) = self.sessions.get_mut(&token) else {
            return Self::err("unknown session");
        };
        let Ok(plain) = session.channel.open(ftype, &cipher) else {
            return Self::err("channel auth failed");
        };
        let username = session.username.clone();

        let inner = self.dispatch(ftype, &username, &plain);

        let session = self.sessions.get_mut(&token).unwrap();
        let sealed = session.channel.seal(ftype, &inner).unwrap();
        frame::encode_sealed_payload(&token, &sealed).unwrap()
    }

    fn dispatch(&mut self, ftype: FrameType, username: &str, payload: &[u8]) -> Vec<u8> {
        match ftype {
            FrameType::Heartbeat | FrameType::Logout => Self::ok(&[]),

            FrameType::PublishPreKeys => {
                let mut r = Reader::new(payload);
                let base_bundle = r.read_bytes().unwrap();
                let count = r.read_u32().unwrap() as usize;
                let mut one_time_pool = Vec::with_capacity(count);
                for _ in 0..count {
                    one_time_pool.push((r.read_u32().unwrap(), r.read_arr32().unwrap()));
                }
                r.finish().unwrap();
                self.bundles.insert(
                    username.to_string(),
                    PublishedKeys {
                        base_bundle,
                        one_time_pool,
                        next: 0,
                    },
                );
                Self::ok(&[])
            }

            FrameType::FetchPreKeyBundle => {
                let mut r = Reader::new(payload);
                let peer = r.read_string().unwrap();
                let known_size = r.read_u64().unwrap();
                r.finish().unwrap();

                let Some(published) = self.bundles.get_mut(&peer) else {
                    return Self::err("no bundle published");
                };
                // One-time prekeys are consumed one per fetch.
                let mut bundle =
                    mi_e2ee::prekeys::PreKeyBundle::decode(&published.base_bundle).unwrap();
                match published.one_time_pool.get(published.next) {
                    Some(&(id, public)) => {
                        published.next += 1;
                        bundle.one_time_id = Some(id);
                        bundle.one_time = Some(public);
                    }
                    None => {
                        bundle.one_time_id = None;
                        bundle.one_time = None;
                    }
                }
                let bundle_bytes = bundle.encode().unwrap();

                let Some(&index) = self.kt.index_by_user.get(&peer) else {
                    return Self::err("not in log");
                };
                let size = self.kt.size();
                let root = self.kt.root();
                let proofs = KtProofBundle {
                    tree_size: size as u64,
                    root,
                    leaf_index: index as u64,
                    audit_path: self.kt.audit_path(index),
                    consistency: self.kt.consistency(known_size as usize),
                    sth_sig: self
                        .sth_signer
                        .as_ref()
                        .unwrap()
                        .sign(&sth_transcript(size as u64, &root))
                        .to_vec(),
                };
                let mut fields = Vec::new();
                wire::write_bytes(&bundle_bytes, &mut fields).unwrap();
                fields.extend_from_slice(&proofs.encode().unwrap());
                Self::ok(&fields)
            }

            FrameType::SendE2ee => {
                let mut r = Reader::new(payload);
                let recipient = r.read_string().unwrap();
                let message = r.read_bytes().unwrap();
                r.finish().unwrap();
                self.e2ee_queues.entry(recipient).or_default().push(message);
                Self::ok(&[])
            }

            FrameType::PullE2ee => {
                let queue = self
                    .e2ee_queues
                    .remove(username)
                    .unwrap_or_default();
                Self::ok(&encode_blob_list(&queue))
            }

            FrameType::SendGroupE2ee => {
                let mut r = Reader::new(payload);
                let group_id = r.read_string().unwrap();
                let message = r.read_bytes().unwrap();
                r.finish().unwrap();
                let members = self.groups.get(&group_id).cloned().unwrap_or_default();
                for member in members {
                    if member != username {
                        self.group_queues
                            .entry(member)
                            .or_default()
                            .push(message.clone());
                    }
                }
                Self::ok(&[])
            }

            FrameType::PullGroupE2ee => {
                let queue = self.group_queues.remove(username).unwrap_or_default();
                Self::ok(&encode_blob_list(&queue))
            }

            FrameType::PullGroupNotices => {
                let notices = self.notice_queues.remove(username).unwrap_or_default();
                let mut fields = Vec::new();
                wire::write_u32(notices.len() as u32, &mut fields);
                for (group_id, kind, member, actor, role) in notices {
                    wire::write_string(&group_id, &mut fields).unwrap();
                    wire::write_u8(kind, &mut fields);
                    wire::write_string(&member, &mut fields).unwrap();
                    wire::write_string(&actor, &mut fields).unwrap();
                    wire::write_u8(role, &mut fields);
                }
                Self::ok(&fields)
            }

            FrameType::ListGroupMembers => {
                let mut r = Reader::new(payload);
                let group_id = r.read_string().unwrap();
                let members = self.groups.get(&group_id).cloned().unwrap_or_default();
                let mut fields = Vec::new();
                wire::write_u32(members.len() as u32, &mut fields);
                for member in members {
                    wire::write_string(&member, &mut fields).unwrap();
                    wire::write_u8(0, &mut fields);
                }
                Self::ok(&fields)
            }

            FrameType::KickGroupMember => {
                let mut r = Reader::new(payload);
                let group_id = r.read_string().unwrap();
                let member = r.read_string().unwrap();
                r.finish().unwrap();
                if let Some(roster) = self.groups.get_mut(&group_id) {
                    roster.retain(|m| m != &member);
                    for remaining in roster.clone() {
                        self.notice_queues.entry(remaining).or_default().push((
                            group_id.clone(),
                            3, // kick
                            member.clone(),
                            username.to_string(),
                            0,
                        ));
                    }
                }
                Self::ok(&[])
            }

            FrameType::DeviceSyncPush => {
                let mut r = Reader::new(payload);
                let from_device = r.read_string().unwrap();
                let cipher = r.read_bytes().unwrap();
                r.finish().unwrap();
                self.sync_messages.push(SyncMessage {
                    username: username.to_string(),
                    from_device,
                    cipher,
                    delivered_to: HashSet::new(),
                });
                Self::ok(&[])
            }

            FrameType::DeviceSyncPull => {
                let mut r = Reader::new(payload);
                let device_id = r.read_string().unwrap();
                r.finish().unwrap();
                let mut out = Vec::new();
                for msg in self.sync_messages.iter_mut() {
                    if msg.username == username
                        && msg.from_device != device_id
                        && !msg.delivered_to.contains(&device_id)
                    {
                        msg.delivered_to.insert(device_id.clone());
                        out.push(msg.cipher.clone());
                    }
                }
                Self::ok(&encode_blob_list(&out))
            }

            FrameType::DevicePairingPublish => {
                let mut r = Reader::new(payload);
                let pairing_id = r.read_string().unwrap();
                self.pairing_boxes.entry(pairing_id).or_default();
                Self::ok(&[])
            }

            FrameType::DevicePairingRequest => {
                let mut r = Reader::new(payload);
                let pairing_id = r.read_string().unwrap();
                let cipher = r.read_bytes().unwrap();
                let Some(pbox) = self.pairing_boxes.get_mut(&pairing_id) else {
                    return Self::err("unknown pairing id");
                };
                pbox.requests.push(cipher);
                Self::ok(&[])
            }

            FrameType::DevicePairingPull => {
                let mut r = Reader::new(payload);
                let mode = r.read_u8().unwrap();
                let pairing_id = r.read_string().unwrap();
                let Some(pbox) = self.pairing_boxes.get_mut(&pairing_id) else {
                    return Self::err("unknown pairing id");
                };
                let blobs = if mode == 0 {
                    std::mem::take(&mut pbox.requests)
                } else {
                    let device_id = r.read_string().unwrap();
                    pbox.responses.remove(&device_id).unwrap_or_default()
                };
                Self::ok(&encode_blob_list(&blobs))
            }

            FrameType::DevicePairingRespond => {
                let mut r = Reader::new(payload);
                let pairing_id = r.read_string().unwrap();
                let device_id = r.read_string().unwrap();
                let cipher = r.read_bytes().unwrap();
                let Some(pbox) = self.pairing_boxes.get_mut(&pairing_id) else {
                    return Self::err("unknown pairing id");
                };
                pbox.responses.entry(device_id).or_default().push(cipher);
                Self::ok(&[])
            }

            other => Self::err(&format!("unimplemented op {other:?}")),
        }
    }
}

fn encode_blob_list(blobs: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    wire::write_u32(blobs.len() as u32, &mut out);
    for blob in blobs {
        wire::write_bytes(blob, &mut out).unwrap();
    }
    out
}

// ── Transport adapter ────────────────────────────────────────────────────────

#[derive(Clone)]
struct RelayTransport {
    relay: Arc<Mutex<Relay>>,
}

impl Transport for RelayTransport {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(self.relay.lock().handle(request))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

// ── Test harness ─────────────────────────────────────────────────────────────

struct TestClient {
    core: ClientCore,
    _dir: TempDir,
}

fn make_client(relay: &Arc<Mutex<Relay>>, username: &str, primary: bool) -> TestClient {
    let dir = TempDir::new().unwrap();
    let config = ClientConfig {
        endpoint_host: "relay.test".into(),
        auth_mode: AuthMode::Legacy,
        transport: TransportChoice::Tcp,
        cover_traffic: CoverTrafficMode::Off,
        data_dir: dir.path().to_path_buf(),
        kt_require_sth_signature: true,
        kt_sth_public: Some(relay.lock().sth_public()),
        device_sync_primary: primary,
        ..Default::default()
    };
    let store = StateStore::open(dir.path(), username).unwrap();
    let core = ClientCore::with_transport(
        config,
        username,
        store,
        Box::new(RelayTransport {
            relay: Arc::clone(relay),
        }),
    )
    .unwrap();
    TestClient { core, _dir: dir }
}

fn login(client: &mut TestClient, password: &str) {
    client.core.register(password).unwrap();
    client.core.login(password).unwrap();
    client.core.ensure_prekeys_published().unwrap();
}

fn mutual_trust(a: &mut TestClient, b_name: &str, b: &mut TestClient, a_name: &str) {
    let sas_ab = a.core.peer_sas(b_name).unwrap();
    let sas_ba = b.core.peer_sas(a_name).unwrap();
    assert_eq!(sas_ab.len(), 24);
    assert_eq!(sas_ba.len(), 24);
    a.core.trust_pending_peer(b_name).unwrap();
    b.core.trust_pending_peer(a_name).unwrap();
}

#[test]
fn register_login_heartbeat() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    login(&mut alice, "correct horse");
    alice.core.heartbeat().unwrap();
    assert!(alice.core.is_authenticated());
}

#[test]
fn wrong_password_rejected() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    alice.core.register("right").unwrap();
    assert!(alice.core.login("wrong").is_err());
    assert!(!alice.core.is_authenticated());
}

#[test]
fn private_text_roundtrip_with_ack() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");
    mutual_trust(&mut alice, "bob", &mut bob, "alice");

    let msg_id = alice.core.send_chat_text("bob", "hello bob").unwrap();

    let result = bob.core.poll_chat().unwrap();
    let text_events: Vec<_> = result
        .events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Text { from, text, msg_id, .. } => Some((from.clone(), text.clone(), *msg_id)),
            _ => None,
        })
        .collect();
    assert_eq!(text_events, vec![("alice".to_string(), "hello bob".to_string(), msg_id)]);

    // Alice receives the delivery ack on her next sweep.
    let result = alice.core.poll_chat().unwrap();
    assert!(result
        .events
        .iter()
        .any(|e| matches!(e, ChatEvent::Delivered { from, msg_id: m } if from == "bob" && *m == msg_id)));
}

#[test]
fn duplicate_delivery_surfaces_once() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");
    mutual_trust(&mut alice, "bob", &mut bob, "alice");

    alice.core.send_chat_text("bob", "once").unwrap();
    // Duplicate the queued message relay-side (a retrying relay).
    {
        let mut relay = relay.lock();
        let queue = relay.e2ee_queues.get_mut("bob").unwrap();
        let copy = queue[0].clone();
        queue.push(copy);
    }
    let result = bob.core.poll_chat().unwrap();
    let texts = result
        .events
        .iter()
        .filter(|e| matches!(e, ChatEvent::Text { .. }))
        .count();
    assert_eq!(texts, 1);
}

#[test]
fn untrusted_peer_refused() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");

    let err = alice.core.send_chat_text("bob", "psst").unwrap_err();
    assert_eq!(err.kind(), mi_client::ErrorKind::TrustViolation);
}

#[test]
fn group_text_with_sender_key_distribution() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");
    mutual_trust(&mut alice, "bob", &mut bob, "alice");
    relay
        .lock()
        .groups
        .insert("g1".into(), vec!["alice".into(), "bob".into()]);

    alice.core.send_group_chat_text("g1", "hi group").unwrap();

    // Bob's sweep: the pairwise distribution lands first, then the group
    // message decrypts with the fresh chain.
    let result = bob.core.poll_chat().unwrap();
    assert!(result.events.iter().any(|e| matches!(
        e,
        ChatEvent::Text { from, group_id, text, .. }
            if from == "alice" && group_id == "g1" && text == "hi group"
    )));

    // Alice's sweep consumes bob's ack; the distribution is no longer
    // outstanding and a second send does not rotate.
    alice.core.poll_chat().unwrap();
    alice.core.send_group_chat_text("g1", "second").unwrap();
    let result = bob.core.poll_chat().unwrap();
    assert!(result.events.iter().any(|e| matches!(
        e,
        ChatEvent::Text { text, .. } if text == "second"
    )));
}

#[test]
fn kick_rotates_sender_key_for_remaining_members() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    let mut carol = make_client(&relay, "carol", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");
    login(&mut carol, "pw-c");
    mutual_trust(&mut alice, "bob", &mut bob, "alice");
    mutual_trust(&mut alice, "carol", &mut carol, "alice");
    relay.lock().groups.insert(
        "g1".into(),
        vec!["alice".into(), "bob".into(), "carol".into()],
    );

    alice.core.send_group_chat_text("g1", "to all three").unwrap();
    bob.core.poll_chat().unwrap();
    carol.core.poll_chat().unwrap();

    // Kick carol; the notice dirties alice's chain on her next sweep.
    alice.core.kick_group_member("g1", "carol").unwrap();
    alice.core.poll_chat().unwrap();

    alice.core.send_group_chat_text("g1", "just us now").unwrap();

    let result = bob.core.poll_chat().unwrap();
    assert!(result.events.iter().any(|e| matches!(
        e,
        ChatEvent::Text { text, .. } if text == "just us now"
    )));

    // Carol got nothing new on the group channel.
    let result = carol.core.poll_chat().unwrap();
    assert!(!result.events.iter().any(|e| matches!(
        e,
        ChatEvent::Text { text, .. } if text == "just us now"
    )));
}

#[test]
fn pairing_hands_over_the_sync_key() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut primary = make_client(&relay, "alice", true);
    login(&mut primary, "pw-a");

    let mut linked = make_client(&relay, "alice", false);
    linked.core.login("pw-a").unwrap();

    let code = primary.core.begin_pairing_primary().unwrap();

    linked.core.begin_pairing_linked(&code).unwrap();
    assert!(!linked.core.poll_pairing_linked().unwrap());

    let requests = primary.core.poll_pairing_requests().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].device_id, linked.core.device_id());
    primary
        .core
        .approve_pairing_request(&requests[0], Vec::new())
        .unwrap();

    assert!(linked.core.poll_pairing_linked().unwrap());
}

#[test]
fn logout_drops_session_state() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");
    mutual_trust(&mut alice, "bob", &mut bob, "alice");
    alice.core.send_chat_text("bob", "before logout").unwrap();

    alice.core.logout().unwrap();
    assert!(!alice.core.is_authenticated());
    // Every operation needing the channel now refuses before the network.
    let err = alice.core.heartbeat().unwrap_err();
    assert_eq!(err.kind(), mi_client::ErrorKind::NotAuthenticated);
    let err = alice.core.poll_chat().unwrap_err();
    assert_eq!(err.kind(), mi_client::ErrorKind::NotAuthenticated);

    // A fresh login re-authenticates; the wiped ratchet table means the
    // next send establishes a brand-new session.
    alice.core.login("pw-a").unwrap();
    alice.core.poll_chat().unwrap();
    alice.core.send_chat_text("bob", "after relogin").unwrap();
    let result = bob.core.poll_chat().unwrap();
    assert!(result.events.iter().any(|e| matches!(
        e,
        ChatEvent::Text { text, .. } if text == "after relogin"
    )));
}

#[test]
fn kt_snapshot_advances_across_fetches() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");

    // First fetch: log has two users.
    alice.core.fetch_prekey_bundle("bob").unwrap();

    // A third user registers and publishes; the next fetch must verify
    // consistency from the old snapshot to the grown log.
    let mut carol = make_client(&relay, "carol", true);
    login(&mut carol, "pw-c");

    alice.core.fetch_prekey_bundle("carol").unwrap();
    assert!(!alice.core.kt_alert());
}

#[test]
fn forged_sth_is_refused() {
    let relay = Arc::new(Mutex::new(Relay::new()));
    let mut alice = make_client(&relay, "alice", true);
    let mut bob = make_client(&relay, "bob", true);
    login(&mut alice, "pw-a");
    login(&mut bob, "pw-b");

    // Swap the log signer after registration: STH signatures stop
    // verifying against the configured key.
    relay.lock().sth_signer = Some(IdentityKeyset::generate());
    let err = alice.core.fetch_prekey_bundle("bob").unwrap_err();
    assert_eq!(err.kind(), mi_client::ErrorKind::TrustViolation);
}
