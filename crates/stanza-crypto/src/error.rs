//! Error types for cryptographic operations

use thiserror::Error;

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Crypto error types
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Decrypt stream did not start with the expected salted header
    #[error("cipher header invalid")]
    HeaderInvalid,

    /// Flush was requested before any header was read or generated
    #[error("cipher header missing")]
    HeaderMissing,

    /// Final cipher block could not be processed, e.g. bad padding from a
    /// wrong key or truncated ciphertext
    #[error("unable to flush")]
    FlushFailed,

    /// Ciphertext length is not a whole number of cipher blocks
    #[error("unable to process cipher")]
    ProcessFailed,
}
