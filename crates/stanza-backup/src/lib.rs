//! Per-file backup and restore orchestration.
//!
//! The state machines that decide, for one file at a time, whether to
//! copy, re-copy, reference, skip or verify, and that wire the right
//! filter stack for each case:
//!
//! - [`backup_file`]: cluster to repository, with delta detection against
//!   the prior manifest and repository-side verification.
//! - [`restore_file`]: repository to cluster, with delta shortcuts,
//!   zero-file materialization and a hard checksum gate.
//! - [`verify_file`]: repository self-check without touching the cluster.
//!
//! Failures in the repository-verify step of a backup downgrade to a
//! re-copy; every other failure surfaces. A failed file never poisons the
//! rest of the backup unless the caller chooses so.

pub mod backup;
pub mod error;
pub mod page_checksum;
pub mod restore;
pub mod verify;

pub use backup::{
    BackupBlockIncr, BackupCopyResult, BackupFileParam, BackupFileResult, backup_file,
};
pub use error::{BackupError, Result};
pub use page_checksum::{PG_PAGE_SIZE_DEFAULT, PG_SEGMENT_PAGE_DEFAULT, PageChecksumFilter};
pub use restore::{RestoreBlockIncr, RestoreFileParam, restore_file};
pub use verify::{VerifyFileResult, verify_file};
