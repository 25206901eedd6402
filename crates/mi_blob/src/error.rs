use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob header invalid")]
    BadHeader,

    #[error("Unsupported blob version {0}")]
    BadVersion(u8),

    #[error("Unsupported cipher algorithm {0}")]
    BadAlgo(u8),

    #[error("Blob truncated")]
    Truncated,

    #[error("Blob too large: {0} bytes")]
    TooLarge(u64),

    #[error("Chunk authentication failed")]
    AuthFailed,

    #[error("Deflate pipeline failed: {0}")]
    Deflate(String),

    #[error("Size field mismatch")]
    SizeMismatch,

    #[error("Transfer offset out of range")]
    BadOffset,

    #[error("Transfer already complete")]
    TransferComplete,
}

impl From<mi_crypto::CryptoError> for BlobError {
    fn from(_: mi_crypto::CryptoError) -> Self {
        BlobError::AuthFailed
    }
}
