//! Error types for storage drivers and the protocol session

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage error types.
///
/// File errors carry the path and the underlying IO failure verbatim;
/// protocol errors re-raise the remote error with the session name
/// prepended.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("unable to open '{path}' for read: {source}")]
    FileOpen {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to read '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to write '{path}': {source}")]
    FileWrite {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to get info for '{path}': {source}")]
    FileInfo {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to remove '{path}': {source}")]
    FileRemove {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to create path '{path}': {source}")]
    PathCreate {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to remove path '{path}': {source}")]
    PathRemove {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to sync path '{path}': {source}")]
    PathSync {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to create link '{path}': {source}")]
    LinkCreate {
        path: String,
        source: std::io::Error,
    },

    /// Session-level IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed protocol frame
    #[error(transparent)]
    Pack(#[from] stanza_pack::PackError),

    /// Protocol peer reported an error; re-raised locally
    #[error("raised from {session}: {message}")]
    Raised {
        session: String,
        kind: String,
        message: String,
        stack: String,
    },

    /// Protocol peer misbehaved (unknown command, unexpected frame)
    #[error("{0}")]
    Execute(String),

    /// Caller violated the storage contract; indicates a bug
    #[error("{0}")]
    Assert(String),
}

impl StorageError {
    /// Stable kind string used to serialize errors over the protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileOpen { .. } => "FileOpenError",
            Self::FileRead { .. } => "FileReadError",
            Self::FileWrite { .. } => "FileWriteError",
            Self::FileInfo { .. } => "FileInfoError",
            Self::FileRemove { .. } => "FileRemoveError",
            Self::PathCreate { .. } => "PathCreateError",
            Self::PathRemove { .. } => "PathRemoveError",
            Self::PathSync { .. } => "PathSyncError",
            Self::LinkCreate { .. } => "LinkCreateError",
            Self::Io(_) => "FileReadError",
            Self::Pack(_) => "FormatError",
            Self::Raised { .. } => "ExecuteError",
            Self::Execute(_) => "ExecuteError",
            Self::Assert(_) => "AssertError",
        }
    }
}
