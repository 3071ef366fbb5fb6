//! Verify file
//!
//! Repository self-check: stream a stored file through the reverse filter
//! stack and classify the outcome without touching the cluster.

use tracing::debug;

use stanza_crypto::{CipherMode, HashType};
use stanza_filter::cipher::CipherFilter;
use stanza_filter::hash::HASH_FILTER_TYPE;
use stanza_filter::size::SIZE_FILTER_TYPE;
use stanza_filter::{
    CompressType, FilterGroup, HashFilter, SizeFilter, decompress_filter, io as filter_io,
};
use stanza_pack::PackRead;
use stanza_storage::{ReadParam, Storage};

use crate::error::Result;

/// Outcome of verifying one repository file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFileResult {
    Ok,
    Missing,
    ChecksumMismatch,
    SizeMismatch,
    /// The file could not be read, decrypted or decompressed
    Unreadable,
}

/// Verify one repository file against its manifest checksum and size.
pub fn verify_file(
    repo: &dyn Storage,
    repo_path: &str,
    compress: CompressType,
    expected_checksum: &[u8],
    expected_size: u64,
    cipher_pass: Option<&[u8]>,
) -> Result<VerifyFileResult> {
    let Some(mut reader) = repo.new_read(repo_path, ReadParam::new().ignore_missing())? else {
        return Ok(VerifyFileResult::Missing);
    };

    let mut group = FilterGroup::new();

    if let Some(pass) = cipher_pass {
        group.add(Box::new(CipherFilter::new(CipherMode::Decrypt, pass)));
    }

    if let Some(filter) = decompress_filter(compress)? {
        group.add(filter);
    }

    group.add(Box::new(HashFilter::new(HashType::Sha1)));
    group.add(Box::new(SizeFilter::new()));

    // An unreadable file is a verify finding, not a verify failure
    if let Err(err) = filter_io::drain(&mut reader, &mut group) {
        debug!(file = repo_path, %err, "verify unreadable");
        return Ok(VerifyFileResult::Unreadable);
    }

    let checksum = match group.result(HASH_FILTER_TYPE) {
        Some(pack) => PackRead::new(pack).read_bin()?,
        None => return Ok(VerifyFileResult::Unreadable),
    };

    let size = match group.result(SIZE_FILTER_TYPE) {
        Some(pack) => PackRead::new(pack).read_u64()?,
        None => return Ok(VerifyFileResult::Unreadable),
    };

    let result = if checksum != expected_checksum {
        VerifyFileResult::ChecksumMismatch
    } else if size != expected_size {
        VerifyFileResult::SizeMismatch
    } else {
        VerifyFileResult::Ok
    };

    debug!(file = repo_path, result = ?result, "verify file");
    Ok(result)
}
