//! Client-visible error model.
//!
//! Every operation returns `Result<_, ClientError>`; the `kind()` drives
//! caller policy (retry, re-verify, abort). State partially mutated by a
//! failing call is rolled back before the error surfaces, except resumable
//! transfers, which deliberately keep their server-side prefix.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad arguments; nothing touched.
    InvalidInput,
    /// No live session; the network was not touched.
    NotAuthenticated,
    /// DNS/connect/send/recv/timeout; the stream was discarded, retry is fine.
    Transport,
    /// Framing or length violation; the stream was discarded.
    ProtocolInvalid,
    /// AEAD failure; the offending frame/message was dropped silently.
    AuthFailure,
    /// Pin mismatch, KT proof failure, peer untrusted; latched until acted on.
    TrustViolation,
    /// Unsupported scheme or parameters; the session aborts.
    CryptoPolicy,
    /// Local resource problem (file, lock, size).
    Resource,
    /// Typed error payload from the server, forwarded verbatim.
    Server,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error(transparent)]
    Transport(#[from] mi_transport::TransportError),

    #[error("protocol invalid: {0}")]
    ProtocolInvalid(String),

    #[error("authentication failed")]
    AuthFailure,

    #[error("trust violation: {0}")]
    TrustViolation(String),

    #[error("crypto policy violation: {0}")]
    CryptoPolicy(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("server error: {0}")]
    Server(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::InvalidInput(_) => ErrorKind::InvalidInput,
            ClientError::NotAuthenticated => ErrorKind::NotAuthenticated,
            ClientError::Transport(_) => ErrorKind::Transport,
            ClientError::ProtocolInvalid(_) => ErrorKind::ProtocolInvalid,
            ClientError::AuthFailure => ErrorKind::AuthFailure,
            ClientError::TrustViolation(_) => ErrorKind::TrustViolation,
            ClientError::CryptoPolicy(_) => ErrorKind::CryptoPolicy,
            ClientError::Resource(_) => ErrorKind::Resource,
            ClientError::Server(_) => ErrorKind::Server,
        }
    }
}

impl From<mi_proto::ProtoError> for ClientError {
    fn from(e: mi_proto::ProtoError) -> Self {
        match e {
            mi_proto::ProtoError::AuthFailed => ClientError::AuthFailure,
            other => ClientError::ProtocolInvalid(other.to_string()),
        }
    }
}

impl From<mi_crypto::CryptoError> for ClientError {
    fn from(e: mi_crypto::CryptoError) -> Self {
        match e {
            mi_crypto::CryptoError::AeadOpen => ClientError::AuthFailure,
            mi_crypto::CryptoError::KeyDerivation(msg) => ClientError::CryptoPolicy(msg),
            other => ClientError::CryptoPolicy(other.to_string()),
        }
    }
}

impl From<mi_kt::KtError> for ClientError {
    fn from(e: mi_kt::KtError) -> Self {
        ClientError::TrustViolation(e.to_string())
    }
}

impl From<mi_e2ee::E2eeError> for ClientError {
    fn from(e: mi_e2ee::E2eeError) -> Self {
        use mi_e2ee::E2eeError::*;
        match e {
            PeerNotTrusted(p) => ClientError::TrustViolation(format!("peer {p} not trusted")),
            KeyChanged(p) => ClientError::TrustViolation(format!("identity key changed for {p}")),
            AuthFailed => ClientError::AuthFailure,
            Crypto(c) => c.into(),
            Proto(p) => p.into(),
            other => ClientError::ProtocolInvalid(other.to_string()),
        }
    }
}

impl From<mi_blob::BlobError> for ClientError {
    fn from(e: mi_blob::BlobError) -> Self {
        use mi_blob::BlobError::*;
        match e {
            AuthFailed => ClientError::AuthFailure,
            TooLarge(n) => ClientError::Resource(format!("blob too large: {n} bytes")),
            other => ClientError::Resource(other.to_string()),
        }
    }
}

impl From<mi_sync::SyncError> for ClientError {
    fn from(e: mi_sync::SyncError) -> Self {
        ClientError::InvalidInput(e.to_string())
    }
}
