use thiserror::Error;

#[derive(Debug, Error)]
pub enum E2eeError {
    #[error(transparent)]
    Crypto(#[from] mi_crypto::CryptoError),

    #[error(transparent)]
    Proto(#[from] mi_proto::ProtoError),

    #[error("Peer {0} is not trusted; confirm the SAS first")]
    PeerNotTrusted(String),

    #[error("Identity key changed for {0}; re-verification required")]
    KeyChanged(String),

    #[error("No session with {0}")]
    NoSession(String),

    #[error("Too many skipped messages")]
    SkipBudgetExceeded,

    #[error("Message authentication failed")]
    AuthFailed,

    #[error("Sender key missing or stale (group {group}, want version {want})")]
    SenderKeyStale { group: String, want: u32 },

    #[error("Invalid sender-key distribution: {0}")]
    BadDistribution(String),

    #[error("Prekey bundle invalid: {0}")]
    BadBundle(String),

    #[error("Consumed one-time prekey {0} not found")]
    UnknownPreKey(u32),
}
