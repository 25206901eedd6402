//! mi_transport — relay transports
//!
//! Three back-ends with one contract: a blocking
//! `round_trip(request) → response` over a length-framed byte stream.
//! Higher layers never see the transport beyond [`TransportKind`], which is
//! mixed into the session key derivation.
//!
//! - `tcp`    — persistent stream, optional SOCKS5 hop, reconnect on error
//! - `tls`    — TLS 1.2+ with a pinned leaf-certificate fingerprint
//! - `kcp`    — reliable UDP with a cookie handshake (no proxy support)
//! - `socks5` — CONNECT subnegotiation used by the TCP back-end

pub mod error;
pub mod kcp;
pub mod socks5;
pub mod tcp;
pub mod tls;

pub use error::TransportError;

use std::fmt;

/// Which back-end carries the session. The byte value is bound into the
/// channel key derivation so keys cannot migrate across transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportKind {
    Tcp = 1,
    Tls = 2,
    Kcp = 3,
}

impl TransportKind {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Trust-store key for this endpoint.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A blocking request/response transport. One round trip may be in flight
/// per endpoint at a time; implementations serialize internally.
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: &[u8]) -> Result<Vec<u8>, TransportError>;
    fn kind(&self) -> TransportKind;

    /// Discard any persistent connection state; the next round trip starts
    /// fresh. Called by higher layers on framing violations, where the
    /// stream position can no longer be trusted.
    fn reset(&self) {}
}

/// Upper bound on a framed transport message (response side as well).
/// Slightly above the frame-payload cap so framing overhead never trips it.
pub const MAX_MESSAGE_LEN: usize = 10 * 1024 * 1024;

/// Default I/O timeout for stream transports.
pub const STREAM_TIMEOUT_SECS: u64 = 30;
