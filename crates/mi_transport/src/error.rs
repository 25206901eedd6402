use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("DNS resolution failed for {0}")]
    Dns(String),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Round-trip timed out")]
    Timeout,

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Transport protocol violation: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Pinned certificate mismatch (expected {expected}, got {got})")]
    PinMismatch { expected: String, got: String },

    #[error("Message too large: {0} bytes")]
    Oversize(usize),
}
