//! Error types for pack encoding and decoding

use thiserror::Error;

/// Result type for pack operations
pub type Result<T> = std::result::Result<T, PackError>;

/// Pack error types
#[derive(Error, Debug)]
pub enum PackError {
    /// Malformed pack data: truncated buffer, unterminated varint,
    /// unexpected field type
    #[error("{0}")]
    Format(String),

    /// Internal invariant violated, e.g. mismatched container begin/end.
    /// Indicates a bug in the caller, not corrupt data.
    #[error("{0}")]
    Assert(String),
}
