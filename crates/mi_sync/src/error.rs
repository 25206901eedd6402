use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Device sync key invalid")]
    InvalidKey,

    #[error("Pairing code invalid")]
    BadPairingCode,

    #[error("Pairing not active")]
    PairingNotActive,

    #[error("Pairing not pending a response")]
    PairingNotPending,

    #[error("Not the primary device")]
    NotPrimary,

    #[error("Device sync key already present")]
    KeyAlreadyPresent,
}
