//! Secure session channel.
//!
//! After the handshake both sides hold `{k_send, k_recv, nonce_send_base,
//! nonce_recv_base}` bound to (user, session token, transport kind). Every
//! frame payload is sealed with a monotonic per-direction counter XORed into
//! the low eight bytes of the nonce base; the AD binds the counter and the
//! frame-type byte.
//!
//! Wire form of a sealed payload: `u64 counter LE ∥ mac(16) ∥ cipher`.
//! Receivers accept a frame only if its counter is strictly greater than
//! the last accepted one; duplicates, reorders, and injections fall out as
//! authentication failures or counter rejections and are dropped.

use zeroize::{ZeroizeOnDrop, Zeroizing};

use mi_crypto::{aead, kdf};
use mi_proto::frame::FrameType;
use mi_transport::TransportKind;

use crate::error::ClientError;

const SESSION_KEYS_INFO: &[u8] = b"mi_e2ee_session_keys_v1";

#[derive(ZeroizeOnDrop)]
pub struct SecureChannel {
    k_send: [u8; 32],
    k_recv: [u8; 32],
    nonce_send_base: [u8; 24],
    nonce_recv_base: [u8; 24],
    #[zeroize(skip)]
    send_counter: u64,
    #[zeroize(skip)]
    last_recv_counter: u64,
}

impl SecureChannel {
    /// Derive both directions from the handshake secret. `initiator` keys
    /// the client side; the mirrored call (`initiator = false`) is what the
    /// relay computes.
    pub fn derive(
        handshake_secret: &[u8],
        username: &str,
        session_token: &str,
        transport: TransportKind,
        initiator: bool,
    ) -> Result<Self, ClientError> {
        let mut info = SESSION_KEYS_INFO.to_vec();
        info.extend_from_slice(username.as_bytes());
        info.push(0);
        info.extend_from_slice(session_token.as_bytes());
        info.push(0);
        info.push(transport.as_byte());

        let mut okm = Zeroizing::new([0u8; 112]);
        kdf::hkdf_expand(handshake_secret, None, &info, okm.as_mut())?;

        let mut client_send = [0u8; 32];
        let mut server_send = [0u8; 32];
        let mut client_nonce = [0u8; 24];
        let mut server_nonce = [0u8; 24];
        client_send.copy_from_slice(&okm[0..32]);
        server_send.copy_from_slice(&okm[32..64]);
        client_nonce.copy_from_slice(&okm[64..88]);
        server_nonce.copy_from_slice(&okm[88..112]);

        let channel = if initiator {
            Self {
                k_send: client_send,
                k_recv: server_send,
                nonce_send_base: client_nonce,
                nonce_recv_base: server_nonce,
                send_counter: 0,
                last_recv_counter: 0,
            }
        } else {
            Self {
                k_send: server_send,
                k_recv: client_send,
                nonce_send_base: server_nonce,
                nonce_recv_base: client_nonce,
                send_counter: 0,
                last_recv_counter: 0,
            }
        };
        Ok(channel)
    }

    fn nonce_for(base: &[u8; 24], counter: u64) -> [u8; 24] {
        let mut nonce = *base;
        let ctr = counter.to_le_bytes();
        for (i, b) in ctr.iter().enumerate() {
            nonce[16 + i] ^= b;
        }
        nonce
    }

    fn aad(counter: u64, ftype: FrameType) -> [u8; 9] {
        let mut ad = [0u8; 9];
        ad[..8].copy_from_slice(&counter.to_le_bytes());
        ad[8] = ftype as u8;
        ad
    }

    /// Seal a payload. The counter advances here, before any transport
    /// write, so a failed send can never reuse it.
    pub fn seal(&mut self, ftype: FrameType, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        let counter = self
            .send_counter
            .checked_add(1)
            .ok_or_else(|| ClientError::CryptoPolicy("send counter overflow".into()))?;
        self.send_counter = counter;

        let nonce = Self::nonce_for(&self.nonce_send_base, counter);
        let (mac, cipher) = aead::seal_detached(&self.k_send, &nonce, &Self::aad(counter, ftype), payload)?;

        let mut out = Vec::with_capacity(8 + 16 + cipher.len());
        out.extend_from_slice(&counter.to_le_bytes());
        out.extend_from_slice(&mac);
        out.extend_from_slice(&cipher);
        Ok(out)
    }

    /// Open a sealed payload. Rejects non-advancing counters before any
    /// crypto; the stored counter moves only after authentication.
    pub fn open(&mut self, ftype: FrameType, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, ClientError> {
        if data.len() < 8 + 16 {
            return Err(ClientError::AuthFailure);
        }
        let counter = u64::from_le_bytes(data[..8].try_into().expect("len"));
        if counter <= self.last_recv_counter {
            return Err(ClientError::AuthFailure);
        }
        let mac: [u8; 16] = data[8..24].try_into().expect("len");
        let nonce = Self::nonce_for(&self.nonce_recv_base, counter);
        let plain = aead::open_detached(
            &self.k_recv,
            &nonce,
            &Self::aad(counter, ftype),
            &mac,
            &data[24..],
        )
        .map_err(|_| ClientError::AuthFailure)?;
        self.last_recv_counter = counter;
        Ok(plain)
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    pub fn last_recv_counter(&self) -> u64 {
        self.last_recv_counter
    }
}
