use thiserror::Error;

pub type SeqScanResult<T, E = SeqScanError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum SeqScanError {
    #[error("snapshot too old")]
    SnapshotTooOld,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Corrupt page: {0}")]
    Corrupt(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SeqScanError {
    /// The undo history the scan needed has been reclaimed.
    pub fn is_snapshot_too_old(&self) -> bool {
        matches!(self, SeqScanError::SnapshotTooOld)
    }
}
