//! Error types for block-incremental operations

use thiserror::Error;

/// Result type for block operations
pub type Result<T> = std::result::Result<T, BlockError>;

/// Block error types
#[derive(Error, Debug)]
pub enum BlockError {
    /// IO error reading super-block bodies
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed block map or super-block record stream
    #[error(transparent)]
    Pack(#[from] stanza_pack::PackError),

    /// Failure in a chained compression or encryption stage
    #[error(transparent)]
    Filter(#[from] stanza_filter::FilterError),

    /// Configuration invariant violated, e.g. a prior map whose checksum
    /// width disagrees with this invocation
    #[error("{0}")]
    Assert(String),
}
