use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Truncated payload")]
    Truncated,

    #[error("Trailing bytes after payload")]
    TrailingBytes,

    #[error("Bad magic")]
    BadMagic,

    #[error("Unsupported version {0}")]
    BadVersion(u8),

    #[error("Unknown tag {0}")]
    UnknownTag(u8),

    #[error("Invalid UTF-8 string")]
    InvalidString,

    #[error("Field too long: {0}")]
    FieldTooLong(&'static str),

    #[error("Invalid padding")]
    InvalidPadding,

    #[error("Payload authentication failed")]
    AuthFailed,
}

impl From<mi_crypto::CryptoError> for ProtoError {
    fn from(_: mi_crypto::CryptoError) -> Self {
        ProtoError::AuthFailed
    }
}
