//! Authentication handshakes.
//!
//! Two modes produce the same thing: a 32-byte handshake secret that feeds
//! the session-key schedule in `channel`.
//!
//! - `legacy`: Argon2id password stretch with server-issued parameters,
//!   mixed with an X25519 exchange, an ML-KEM-768 encapsulation, and the
//!   transcript hash of both nonces and publics. The server proves
//!   knowledge first; its proof is compared in constant time before the
//!   client emits its own. Discouraged for new deployments.
//! - `opaque`: OPAQUE aPAKE (Ristretto255 / TripleDH); the library output
//!   session key is used as the handshake secret. The protocol messages
//!   are treated as opaque byte blobs end to end.

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

use mi_crypto::{ct, hash, kdf, kem};
use mi_proto::wire::{self, Reader};

use crate::error::ClientError;

pub const TRANSCRIPT_TAG: &[u8] = b"mi_e2ee_legacy_transcript_v1";
pub const HANDSHAKE_INFO: &[u8] = b"mi_e2ee_legacy_handshake_v1";
pub const SERVER_PROOF_TAG: &[u8] = b"mi_e2ee_server_proof_v1";
pub const CLIENT_PROOF_TAG: &[u8] = b"mi_e2ee_client_proof_v1";

type HmacSha256 = Hmac<Sha256>;

// ── Legacy mode ──────────────────────────────────────────────────────────────

/// Server half of the hello round.
#[derive(Debug, Clone)]
pub struct LegacyHelloResponse {
    pub salt: [u8; 16],
    pub argon_memory_kib: u32,
    pub argon_passes: u32,
    pub server_nonce: [u8; 32],
    pub server_dh_public: [u8; 32],
    pub kem_public: Vec<u8>,
    pub session_token: String,
}

impl LegacyHelloResponse {
    pub fn encode(&self) -> Result<Vec<u8>, ClientError> {
        let mut out = Vec::with_capacity(128 + self.kem_public.len());
        out.extend_from_slice(&self.salt);
        wire::write_u32(self.argon_memory_kib, &mut out);
        wire::write_u32(self.argon_passes, &mut out);
        wire::write_arr32(&self.server_nonce, &mut out);
        wire::write_arr32(&self.server_dh_public, &mut out);
        wire::write_bytes(&self.kem_public, &mut out)?;
        wire::write_string(&self.session_token, &mut out)?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ClientError> {
        let mut r = Reader::new(data);
        let salt: [u8; 16] = r.take(16)?.try_into().expect("len");
        let argon_memory_kib = r.read_u32()?;
        let argon_passes = r.read_u32()?;
        let server_nonce = r.read_arr32()?;
        let server_dh_public = r.read_arr32()?;
        let kem_public = r.read_bytes()?;
        let session_token = r.read_string()?;
        r.finish()?;
        Ok(Self {
            salt,
            argon_memory_kib,
            argon_passes,
            server_nonce,
            server_dh_public,
            kem_public,
            session_token,
        })
    }
}

/// Client state across the legacy rounds.
pub struct LegacyClient {
    username: String,
    client_nonce: [u8; 32],
    dh_secret: StaticSecret,
    dh_public: [u8; 32],
    derived: Option<LegacyDerived>,
}

struct LegacyDerived {
    secret: Zeroizing<[u8; 32]>,
    transcript: [u8; 32],
    kem_ciphertext: Vec<u8>,
    session_token: String,
}

impl LegacyClient {
    /// Round 1: hello payload `string username ∥ 32B nonce ∥ 32B dh_pub`.
    pub fn start(username: &str) -> Result<(Self, Vec<u8>), ClientError> {
        let mut client_nonce = [0u8; 32];
        OsRng.fill_bytes(&mut client_nonce);
        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let dh_public = X25519Public::from(&dh_secret).to_bytes();

        let mut payload = Vec::with_capacity(2 + username.len() + 64);
        wire::write_string(username, &mut payload)
            .map_err(|_| ClientError::InvalidInput("username too long".into()))?;
        wire::write_arr32(&client_nonce, &mut payload);
        wire::write_arr32(&dh_public, &mut payload);

        Ok((
            Self {
                username: username.to_string(),
                client_nonce,
                dh_secret,
                dh_public,
                derived: None,
            },
            payload,
        ))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Round 2: digest the hello response, derive the handshake secret, and
    /// produce the proof-round request (`bytes kem_ciphertext`).
    pub fn process_hello_response(
        &mut self,
        password: &str,
        response: &LegacyHelloResponse,
    ) -> Result<Vec<u8>, ClientError> {
        let mut password_key = Zeroizing::new(kdf::argon2id_derive(
            password.as_bytes(),
            &response.salt,
            response.argon_memory_kib,
            response.argon_passes,
        )?);

        let dh_out = self
            .dh_secret
            .diffie_hellman(&X25519Public::from(response.server_dh_public));

        let kem_public = kem::KemPublicKey::from_bytes(&response.kem_public)
            .map_err(|e| ClientError::CryptoPolicy(e.to_string()))?;
        let (mut kem_shared, kem_ct) =
            kem::encapsulate(&kem_public).map_err(|e| ClientError::CryptoPolicy(e.to_string()))?;

        let transcript = transcript_hash(
            &self.client_nonce,
            &response.server_nonce,
            &self.dh_public,
            &response.server_dh_public,
            kem_ct.as_bytes(),
        );

        let mut ikm = Zeroizing::new(Vec::with_capacity(96));
        ikm.extend_from_slice(password_key.as_ref());
        ikm.extend_from_slice(dh_out.as_bytes());
        ikm.extend_from_slice(&kem_shared);
        password_key.zeroize();
        kem_shared.zeroize();

        let mut secret = Zeroizing::new([0u8; 32]);
        kdf::hkdf_expand(&ikm, Some(&transcript), HANDSHAKE_INFO, secret.as_mut())?;

        let mut request = Vec::with_capacity(4 + kem_ct.as_bytes().len());
        wire::write_bytes(kem_ct.as_bytes(), &mut request)
            .map_err(|_| ClientError::ProtocolInvalid("kem ciphertext too long".into()))?;

        self.derived = Some(LegacyDerived {
            secret,
            transcript,
            kem_ciphertext: kem_ct.as_bytes().to_vec(),
            session_token: response.session_token.clone(),
        });
        Ok(request)
    }

    /// Round 3 precondition: verify the server proof in constant time.
    pub fn verify_server_proof(&self, proof: &[u8]) -> Result<(), ClientError> {
        let derived = self
            .derived
            .as_ref()
            .ok_or_else(|| ClientError::ProtocolInvalid("handshake out of order".into()))?;
        let expected = proof_mac(&derived.secret, SERVER_PROOF_TAG, &derived.transcript);
        if !ct::ct_eq(&expected, proof) {
            return Err(ClientError::AuthFailure);
        }
        Ok(())
    }

    /// Round 3 payload: our own proof.
    pub fn client_proof(&self) -> Result<Vec<u8>, ClientError> {
        let derived = self
            .derived
            .as_ref()
            .ok_or_else(|| ClientError::ProtocolInvalid("handshake out of order".into()))?;
        Ok(proof_mac(&derived.secret, CLIENT_PROOF_TAG, &derived.transcript).to_vec())
    }

    pub fn kem_ciphertext(&self) -> Option<&[u8]> {
        self.derived.as_ref().map(|d| d.kem_ciphertext.as_slice())
    }

    pub fn session_token(&self) -> Option<&str> {
        self.derived.as_ref().map(|d| d.session_token.as_str())
    }

    /// Hand out the handshake secret for channel derivation.
    pub fn into_secret(mut self) -> Result<(Zeroizing<[u8; 32]>, String), ClientError> {
        let derived = self
            .derived
            .take()
            .ok_or_else(|| ClientError::ProtocolInvalid("handshake incomplete".into()))?;
        Ok((derived.secret, derived.session_token))
    }
}

/// Transcript over everything both sides contributed.
pub fn transcript_hash(
    client_nonce: &[u8; 32],
    server_nonce: &[u8; 32],
    client_dh: &[u8; 32],
    server_dh: &[u8; 32],
    kem_ciphertext: &[u8],
) -> [u8; 32] {
    hash::sha256_tagged(
        TRANSCRIPT_TAG,
        &[client_nonce, server_nonce, client_dh, server_dh, kem_ciphertext],
    )
}

pub fn proof_mac(secret: &[u8; 32], tag: &[u8], transcript: &[u8; 32]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(tag);
    mac.update(transcript);
    mac.finalize().into_bytes().into()
}

/// Derive the handshake secret the way the client does, from the server's
/// view of the exchange (used by the relay; exercised here by tests).
pub fn legacy_secret_from_parts(
    password_key: &[u8; 32],
    dh_shared: &[u8; 32],
    kem_shared: &[u8; 32],
    transcript: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, ClientError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(96));
    ikm.extend_from_slice(password_key);
    ikm.extend_from_slice(dh_shared);
    ikm.extend_from_slice(kem_shared);
    let mut secret = Zeroizing::new([0u8; 32]);
    kdf::hkdf_expand(&ikm, Some(transcript), HANDSHAKE_INFO, secret.as_mut())?;
    Ok(secret)
}

// ── OPAQUE mode ──────────────────────────────────────────────────────────────

pub mod opaque {
    //! Narrow byte-blob wrapper around the OPAQUE library. Nothing outside
    //! this module names a library type.

    use opaque_ke::{
        ClientLogin, ClientLoginFinishParameters, ClientRegistration,
        ClientRegistrationFinishParameters, CredentialResponse, RegistrationResponse,
    };
    use rand::rngs::OsRng;
    use zeroize::Zeroizing;

    use crate::error::ClientError;

    pub struct Suite;

    impl opaque_ke::CipherSuite for Suite {
        type OprfCs = opaque_ke::Ristretto255;
        type KeGroup = opaque_ke::Ristretto255;
        type KeyExchange = opaque_ke::key_exchange::tripledh::TripleDh;
        type Ksf = argon2::Argon2<'static>;
    }

    fn policy(e: impl std::fmt::Display) -> ClientError {
        ClientError::CryptoPolicy(format!("opaque: {e}"))
    }

    /// Registration round 1 → `(state, request)`.
    pub fn register_start(password: &str) -> Result<(Vec<u8>, Vec<u8>), ClientError> {
        let result =
            ClientRegistration::<Suite>::start(&mut OsRng, password.as_bytes()).map_err(policy)?;
        Ok((
            result.state.serialize().to_vec(),
            result.message.serialize().to_vec(),
        ))
    }

    /// Registration round 2 → the upload blob for the server.
    pub fn register_finish(
        state: &[u8],
        password: &str,
        response: &[u8],
    ) -> Result<Vec<u8>, ClientError> {
        let state = ClientRegistration::<Suite>::deserialize(state).map_err(policy)?;
        let response = RegistrationResponse::deserialize(response).map_err(policy)?;
        let result = state
            .finish(
                &mut OsRng,
                password.as_bytes(),
                response,
                ClientRegistrationFinishParameters::default(),
            )
            .map_err(policy)?;
        Ok(result.message.serialize().to_vec())
    }

    /// Login round 1 → `(state, credential request)`.
    pub fn login_start(password: &str) -> Result<(Vec<u8>, Vec<u8>), ClientError> {
        let result = ClientLogin::<Suite>::start(&mut OsRng, password.as_bytes()).map_err(policy)?;
        Ok((
            result.state.serialize().to_vec(),
            result.message.serialize().to_vec(),
        ))
    }

    /// Login round 2 → `(finalization message, session key)`. A wrong
    /// password surfaces here as an error, indistinguishable from a relay
    /// lying about the credential file.
    pub fn login_finish(
        state: &[u8],
        password: &str,
        response: &[u8],
    ) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), ClientError> {
        let state = ClientLogin::<Suite>::deserialize(state).map_err(policy)?;
        let response = CredentialResponse::deserialize(response).map_err(policy)?;
        let result = state
            .finish(
                password.as_bytes(),
                response,
                ClientLoginFinishParameters::default(),
            )
            .map_err(|_| ClientError::AuthFailure)?;
        Ok((
            result.message.serialize().to_vec(),
            Zeroizing::new(result.session_key.to_vec()),
        ))
    }
}
