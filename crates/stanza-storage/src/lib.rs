//! Byte-stream storage abstraction.
//!
//! The backup and restore engines consume storage through the [`Storage`]
//! trait and nothing else: open a read stream, open a write stream, stat,
//! list, create/remove paths, create links, sync. Three drivers live here:
//!
//! - [`posix::PosixStorage`]: local filesystem with optional atomic
//!   rename on write close.
//! - [`memory::MemoryStorage`]: keyed blobs behind the same trait, used
//!   by tests and as the backend of a protocol server.
//! - [`remote::RemoteStorage`]: drives a [`protocol::ProtocolClient`]
//!   session, so a repository on another host looks identical to a local
//!   one.

pub mod error;
pub mod memory;
pub mod posix;
pub mod protocol;
pub mod remote;

pub use error::{Result, StorageError};
pub use memory::MemoryStorage;
pub use posix::PosixStorage;
pub use protocol::{ProtocolClient, ProtocolServer};
pub use remote::RemoteStorage;

use std::io::Read;

/// File type reported by [`Storage::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileType {
    #[default]
    File,
    Path,
    Link,
    Special,
}

/// Stat result. `exists == false` means no other field is meaningful.
#[derive(Debug, Clone, Default)]
pub struct StorageInfo {
    pub exists: bool,
    pub file_type: FileType,
    pub size: u64,
    /// Modification time, seconds since the epoch
    pub time: i64,
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<String>,
}

/// Options for [`Storage::new_read`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadParam {
    /// Return `None` instead of failing when the file is missing
    pub ignore_missing: bool,
    /// Start reading at this byte offset
    pub offset: u64,
    /// Read at most this many bytes
    pub limit: Option<u64>,
}

impl ReadParam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore_missing(mut self) -> Self {
        self.ignore_missing = true;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Options for [`Storage::new_write`].
#[derive(Debug, Clone, Default)]
pub struct WriteParam {
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Modification time to set on close, seconds since the epoch
    pub time: Option<i64>,
    /// Write to a temporary name and rename into place on close
    pub atomic: bool,
    /// Create missing parent paths
    pub create_path: bool,
    /// Keep existing content instead of truncating on open; required for
    /// positioned writes into an existing file
    pub no_truncate: bool,
}

impl WriteParam {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn atomic(mut self) -> Self {
        self.atomic = true;
        self
    }

    pub fn create_path(mut self) -> Self {
        self.create_path = true;
        self
    }

    pub fn no_truncate(mut self) -> Self {
        self.no_truncate = true;
        self
    }
}

/// Driver capabilities a caller may query before relying on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFeature {
    /// The driver may store a file with a different size than was written
    /// (e.g. filesystem compression); stat after write to learn the size
    /// at rest
    Compress,
    /// Writes rename into place atomically on close when requested
    AtomicWrite,
}

/// An open write stream. Data is not durable until [`StorageWrite::close`]
/// returns.
pub trait StorageWrite: std::io::Write {
    /// Complete the write: flush, apply mode/time, rename into place when
    /// atomic.
    fn close(self: Box<Self>) -> Result<()>;

    /// Extend the file to `size` without writing data (sparse when the
    /// driver supports it). Used to materialize zeroed relation files.
    fn truncate(&mut self, size: u64) -> Result<()> {
        let _ = size;
        Err(StorageError::Assert(
            "truncate is not supported by this storage driver".to_string(),
        ))
    }

    /// Write `data` at an absolute offset, extending the file as needed.
    /// Used by delta restore to patch individual blocks in place; open the
    /// write with truncation disabled so existing content survives.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let _ = (offset, data);
        Err(StorageError::Assert(
            "positioned writes are not supported by this storage driver".to_string(),
        ))
    }
}

/// The storage abstraction the engine is written against.
///
/// Single-writer per file, multi-reader; atomic rename semantics on write
/// close are the driver's responsibility when the caller requests them.
pub trait Storage {
    /// Open a read stream. Returns `None` when the file is missing and
    /// `ignore_missing` was set.
    fn new_read(&self, path: &str, param: ReadParam) -> Result<Option<Box<dyn Read>>>;

    /// Open a write stream.
    fn new_write(&self, path: &str, param: WriteParam) -> Result<Box<dyn StorageWrite>>;

    /// Stat a file. A missing file reports `exists == false` rather than
    /// an error.
    fn info(&self, path: &str, follow_link: bool) -> Result<StorageInfo>;

    /// Names directly under `path`, unordered.
    fn list(&self, path: &str) -> Result<Vec<String>>;

    fn link_create(&self, target: &str, link_path: &str) -> Result<()>;

    fn path_create(
        &self,
        path: &str,
        error_on_exists: bool,
        no_parent_create: bool,
        mode: u32,
    ) -> Result<()>;

    /// Remove a path; returns false when it did not exist.
    fn path_remove(&self, path: &str, recurse: bool) -> Result<bool>;

    fn path_sync(&self, path: &str) -> Result<()>;

    fn remove(&self, path: &str, error_on_missing: bool) -> Result<()>;

    /// Reset a file's modification time without rewriting it. Only the
    /// destination-side drivers support this; it is how a delta restore
    /// presents a pristine timestamp on files it did not copy.
    fn time_set(&self, path: &str, time: i64) -> Result<()> {
        let _ = (path, time);
        Err(StorageError::Assert(
            "time set is not supported by this storage driver".to_string(),
        ))
    }

    fn feature(&self, feature: StorageFeature) -> bool {
        let _ = feature;
        false
    }
}
