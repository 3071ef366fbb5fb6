//! Error types for file orchestration

use thiserror::Error;

/// Result type for backup/restore operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Backup and restore error types
#[derive(Error, Debug)]
pub enum BackupError {
    /// Restored content does not match the manifest checksum. Always fatal
    /// to the file in question; the backup is considered corrupt.
    #[error("{0}")]
    Checksum(String),

    /// IO failure outside the storage drivers, e.g. draining a stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage layer failure, surfaced verbatim
    #[error(transparent)]
    Storage(#[from] stanza_storage::StorageError),

    /// Filter pipeline failure
    #[error(transparent)]
    Filter(#[from] stanza_filter::FilterError),

    /// Block-incremental failure
    #[error(transparent)]
    Block(#[from] stanza_block::BlockError),

    /// Malformed filter result
    #[error(transparent)]
    Pack(#[from] stanza_pack::PackError),

    /// Orchestration invariant violated; indicates a bug
    #[error("{0}")]
    Assert(String),
}
