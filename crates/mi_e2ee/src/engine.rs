//! Pairwise engine: session table, trust gate, seal/open.
//!
//! Decrypt-side atomicity: the ratchet step runs on a clone of the session
//! and only replaces the stored state after the AEAD opens, so a forged
//! message can never advance counters or burn skipped keys.

use std::collections::HashMap;

use tracing::debug;
use zeroize::Zeroizing;

use mi_crypto::aead;
use mi_crypto::identity::{self, IdentityKeyset};

use crate::error::E2eeError;
use crate::message::E2eeMessage;
use crate::prekeys::{PreKeyBundle, PreKeyStore};
use crate::ratchet::RatchetSession;
use crate::trust::PeerTrust;
use crate::x3dh::{self, InitHeader};

pub struct PairwiseEngine {
    username: String,
    sessions: HashMap<String, RatchetSession>,
    pub trust: PeerTrust,
}

impl PairwiseEngine {
    pub fn new(username: String, trust: PeerTrust) -> Self {
        Self {
            username,
            sessions: HashMap::new(),
            trust,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn has_session(&self, peer: &str) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn session(&self, peer: &str) -> Option<&RatchetSession> {
        self.sessions.get(peer)
    }

    /// Restore a persisted session (loaded by the state store).
    pub fn insert_session(&mut self, session: RatchetSession) {
        self.sessions.insert(session.peer.clone(), session);
    }

    pub fn sessions(&self) -> impl Iterator<Item = &RatchetSession> {
        self.sessions.values()
    }

    /// Drop all sessions (logout). Secrets wipe on drop.
    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    /// Start an outbound session from a KT-verified bundle. The trust gate
    /// runs first; an untrusted or changed peer never costs us a prekey.
    pub fn start_outbound(
        &mut self,
        my_identity: &IdentityKeyset,
        bundle: &PreKeyBundle,
    ) -> Result<(), E2eeError> {
        let fingerprint = bundle.fingerprint();
        self.trust
            .require_trusted_for_send(&bundle.username, &fingerprint)?;

        let outcome = x3dh::initiate(&self.username, my_identity, bundle)?;
        let mut session = RatchetSession::init_initiator(
            bundle.username.clone(),
            &outcome.root_key,
            &bundle.signed_prekey,
        )?;
        session.pending_init = Some(outcome.header.encode()?);
        debug!(peer = %bundle.username, "pairwise session initiated");
        self.sessions.insert(bundle.username.clone(), session);
        Ok(())
    }

    /// Seal an already padded plaintext for `peer`.
    pub fn seal_message(
        &mut self,
        peer: &str,
        fingerprint: &[u8; 32],
        padded_plaintext: &[u8],
    ) -> Result<Vec<u8>, E2eeError> {
        self.trust.require_trusted_for_send(peer, fingerprint)?;
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| E2eeError::NoSession(peer.to_string()))?;

        let (header, mk) = session.encrypt_step()?;
        let ciphertext = aead::seal_prefixed(
            &mk,
            &E2eeMessage::aad(&self.username, &header),
            padded_plaintext,
        )?;
        let msg = E2eeMessage {
            sender: self.username.clone(),
            init: session.pending_init.clone(),
            header,
            ciphertext,
        };
        Ok(msg.encode()?)
    }

    /// Open an inbound pairwise message; returns `(sender, plaintext)`.
    ///
    /// Trial-and-commit: the ratchet step runs on a copy and replaces the
    /// stored session only once the ciphertext authenticates, so a forged
    /// message neither advances counters nor plants a bogus session.
    ///
    /// A message from an unknown sender must carry an init header (the
    /// responder derivation consumes the advertised one-time prekey). A
    /// message that the existing session cannot open but that carries an
    /// init header is treated as a session reset by the peer — the init is
    /// tried before giving up.
    pub fn open_message(
        &mut self,
        my_identity: &IdentityKeyset,
        prekeys: &mut PreKeyStore,
        data: &[u8],
    ) -> Result<(String, Zeroizing<Vec<u8>>), E2eeError> {
        let msg = E2eeMessage::decode(data)?;
        let sender = msg.sender.clone();

        if let Some(existing) = self.sessions.get(&sender) {
            let mut trial = existing.clone();
            match Self::try_open(&mut trial, &sender, &msg) {
                Ok(plaintext) => {
                    trial.pending_init = None;
                    self.sessions.insert(sender.clone(), trial);
                    return Ok((sender, plaintext));
                }
                Err(e) if msg.init.is_none() => return Err(e),
                Err(_) => {} // fall through to the init path below
            }
        }

        let mut trial = self.responder_from_init(my_identity, prekeys, &sender, &msg)?;
        let plaintext = Self::try_open(&mut trial, &sender, &msg)?;
        trial.pending_init = None;
        self.sessions.insert(sender.clone(), trial);
        Ok((sender, plaintext))
    }

    fn try_open(
        session: &mut RatchetSession,
        sender: &str,
        msg: &E2eeMessage,
    ) -> Result<Zeroizing<Vec<u8>>, E2eeError> {
        let mk = session.decrypt_step(&msg.header)?;
        aead::open_prefixed(&mk, &E2eeMessage::aad(sender, &msg.header), &msg.ciphertext)
            .map_err(|_| E2eeError::AuthFailed)
    }

    fn responder_from_init(
        &mut self,
        my_identity: &IdentityKeyset,
        prekeys: &mut PreKeyStore,
        sender: &str,
        msg: &E2eeMessage,
    ) -> Result<RatchetSession, E2eeError> {
        let init_bytes = msg
            .init
            .as_deref()
            .ok_or_else(|| E2eeError::NoSession(sender.to_string()))?;
        let mut r = mi_proto::wire::Reader::new(init_bytes);
        let init = InitHeader::read_from(&mut r)?;
        r.finish()?;
        if init.initiator != sender {
            return Err(E2eeError::AuthFailed);
        }
        let fingerprint = identity::fingerprint(&init.ik_sign_public, &init.ik_dh_public);
        self.trust.observe_inbound(sender, &fingerprint)?;

        let spk_secret = prekeys
            .spk_secret_for(init.signed_prekey_id)
            .ok_or(E2eeError::UnknownPreKey(init.signed_prekey_id))?;
        let opk = match init.one_time_id {
            Some(id) => Some(prekeys.take_one_time(id)?),
            None => None,
        };
        let root = x3dh::respond(
            my_identity,
            &spk_secret,
            opk.as_ref().map(|k| k.secret()).as_ref(),
            &prekeys.kem_secret()?,
            &init,
        )?;
        debug!(peer = %sender, "pairwise session accepted");
        Ok(RatchetSession::init_responder(
            sender.to_string(),
            &root,
            &spk_secret,
        ))
    }
}
