//! Error types for the filter pipeline

use thiserror::Error;

/// Result type for filter operations
pub type Result<T> = std::result::Result<T, FilterError>;

/// Filter error types
#[derive(Error, Debug)]
pub enum FilterError {
    /// IO error from a compression backend or stream adapter
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed pack data in a filter parameter or result
    #[error(transparent)]
    Pack(#[from] stanza_pack::PackError),

    /// Cipher failure: bad header, wrong key, corrupt final block
    #[error(transparent)]
    Crypto(#[from] stanza_crypto::CryptoError),

    /// Malformed stream data, e.g. a corrupt compression frame
    #[error("{0}")]
    Format(String),

    /// Filter contract violated by the caller; indicates a bug
    #[error("{0}")]
    Assert(String),
}
