use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KtError {
    #[error("Inclusion proof invalid")]
    InclusionInvalid,

    #[error("Consistency proof invalid")]
    ConsistencyInvalid,

    #[error("Log rollback: new size {new} < known size {old}")]
    Rollback { old: u64, new: u64 },

    #[error("Split view: same size, different root")]
    SplitView,

    #[error("STH signature invalid")]
    SthSignatureInvalid,

    #[error("STH signing key not configured")]
    SthKeyMissing,

    #[error("Snapshot encoding invalid")]
    SnapshotInvalid,
}
