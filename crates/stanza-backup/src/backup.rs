//! Backup file
//!
//! The per-file decision tree for one backup: skip, no-op, checksum-match,
//! copy or re-copy, wiring the right filter stack for each outcome.

use std::io::Read;

use tracing::debug;

use stanza_block::block_incr::{BLOCK_INCR_FILTER_TYPE, BlockIncrFilter, BlockIncrParam};
use stanza_crypto::{CipherMode, HashType};
use stanza_filter::cipher::CipherFilter;
use stanza_filter::hash::HASH_FILTER_TYPE;
use stanza_filter::size::SIZE_FILTER_TYPE;
use stanza_filter::{
    CompressType, FilterGroup, HashFilter, SizeFilter, compress_filter, decompress_filter,
    io as filter_io,
};
use stanza_pack::{Pack, PackRead};
use stanza_storage::{ReadParam, Storage, StorageFeature, WriteParam};

use crate::error::{BackupError, Result};
use crate::page_checksum::{
    PG_PAGE_SIZE_DEFAULT, PG_SEGMENT_PAGE_DEFAULT, PAGE_CHECKSUM_FILTER_TYPE, PageChecksumFilter,
};

/// How one file ended up in the backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupCopyResult {
    /// Copied for the first time in this backup
    Copy,
    /// Copied again because the repository copy failed verification
    ReCopy,
    /// Repository copy verified; nothing written
    Checksum,
    /// Source unchanged and already referenced by a prior backup
    NoOp,
    /// Source file vanished from the cluster
    Skip,
}

/// Inputs for one file. Sizes and checksums come from the prior manifest
/// when one exists.
pub struct BackupFileParam<'a> {
    /// Cluster file to copy
    pub pg_file: &'a str,
    /// Is it OK if the cluster file is missing?
    pub pg_file_ignore_missing: bool,
    /// Size recorded in the manifest
    pub pg_file_size: u64,
    /// Copy only `pg_file_size` bytes even if the file has grown; the
    /// extra bytes will be replayed from WAL during recovery
    pub pg_file_copy_exact_size: bool,
    /// SHA-1 recorded in the manifest, when known
    pub pg_file_checksum: Option<&'a [u8]>,
    /// Validate PostgreSQL page checksums during the copy
    pub pg_file_checksum_page: bool,
    /// Upper LSN limit to which page checksums must be valid
    pub pg_file_page_lsn_limit: u64,
    /// Destination within the repository backup path
    pub repo_file: &'a str,
    /// Does the repo file exist in a prior backup in the set?
    pub repo_file_has_reference: bool,
    pub repo_compress: CompressType,
    pub repo_compress_level: i32,
    /// Label of the backup being written
    pub backup_label: &'a str,
    /// Is the delta option on?
    pub delta: bool,
    /// Repository passphrase, when the repo is encrypted
    pub cipher_pass: Option<&'a [u8]>,
    /// Relation segment number, for page checksum numbering
    pub segment_no: u64,
    /// Store the file block-incrementally instead of as one stream
    pub block_incr: Option<BackupBlockIncr<'a>>,
}

/// Block-incremental settings for one file. Compression and encryption
/// move inside the super-blocks, so the outer filters are not used.
pub struct BackupBlockIncr<'a> {
    pub block_size: u64,
    pub super_block_size: u64,
    pub checksum_size: usize,
    /// Reference of the backup being written, for new map entries
    pub reference: u32,
    /// Serialized map from the prior backup, when the file existed there
    pub map_prior: Option<&'a [u8]>,
}

/// Outcome for one file.
#[derive(Debug)]
pub struct BackupFileResult {
    pub result: BackupCopyResult,
    /// Bytes read from the cluster
    pub copy_size: u64,
    /// SHA-1 of the bytes read
    pub copy_checksum: Option<Vec<u8>>,
    /// Bytes at rest in the repository
    pub repo_size: u64,
    /// Page checksum result pack, when validation ran
    pub page_checksum_result: Option<Pack>,
    /// Size of the trailing block map, when stored block-incrementally
    pub block_incr_map_size: Option<u64>,
}

fn group_checksum(group: &FilterGroup) -> Result<Vec<u8>> {
    let pack = group
        .result(HASH_FILTER_TYPE)
        .ok_or_else(|| BackupError::Assert("hash filter result missing".to_string()))?;

    Ok(PackRead::new(pack).read_bin()?)
}

fn group_size(group: &FilterGroup) -> Result<u64> {
    let pack = group
        .result(SIZE_FILTER_TYPE)
        .ok_or_else(|| BackupError::Assert("size filter result missing".to_string()))?;

    Ok(PackRead::new(pack).read_u64()?)
}

fn pg_read(
    pg: &dyn Storage,
    param: &BackupFileParam<'_>,
) -> Result<Option<Box<dyn Read>>> {
    let mut read_param = ReadParam::new();
    read_param.ignore_missing = param.pg_file_ignore_missing;

    if param.pg_file_copy_exact_size {
        read_param.limit = Some(param.pg_file_size);
    }

    Ok(pg.new_read(param.pg_file, read_param)?)
}

/// Verify the repository-side copy by checksumming it through the reverse
/// filter stack. Any failure here (missing, corrupt, undecryptable) means
/// re-copy rather than failing the backup.
fn repo_verify(
    repo: &dyn Storage,
    repo_path: &str,
    param: &BackupFileParam<'_>,
) -> Result<Option<(Vec<u8>, u64)>> {
    let Some(mut reader) = repo.new_read(repo_path, ReadParam::new().ignore_missing())? else {
        return Ok(None);
    };

    let mut group = FilterGroup::new();

    if let Some(pass) = param.cipher_pass {
        group.add(Box::new(CipherFilter::new(CipherMode::Decrypt, pass)));
    }

    if let Some(filter) = decompress_filter(param.repo_compress)? {
        group.add(filter);
    }

    group.add(Box::new(HashFilter::new(HashType::Sha1)));
    group.add(Box::new(SizeFilter::new()));

    filter_io::drain(&mut reader, &mut group)?;

    Ok(Some((group_checksum(&group)?, group_size(&group)?)))
}

/// Copy one file from the cluster into the repository.
///
/// The decision tree: a known checksum with delta enabled first checks the
/// cluster copy (no-op when it matches and a prior reference exists), then
/// the repository copy (checksum-match when it verifies, re-copy when it
/// does not); otherwise the file is copied through hash, size, optional
/// page checksum, compression and encryption filters.
pub fn backup_file(
    pg: &dyn Storage,
    repo: &dyn Storage,
    param: &BackupFileParam<'_>,
) -> Result<BackupFileResult> {
    // Block-incremental files compress and encrypt per super-block, so
    // the object name carries no compression extension
    let repo_path = if param.block_incr.is_some() {
        format!("{}/{}", param.backup_label, param.repo_file)
    } else {
        format!(
            "{}/{}{}",
            param.backup_label,
            param.repo_file,
            param.repo_compress.ext()
        )
    };

    let mut result = BackupFileResult {
        result: BackupCopyResult::Copy,
        copy_size: 0,
        copy_checksum: None,
        repo_size: 0,
        page_checksum_result: None,
        block_incr_map_size: None,
    };

    // If the checksum is known the file may not need to be copied at all
    if let Some(expected_checksum) = param.pg_file_checksum {
        let mut pg_file_match = false;

        // With delta on, check whether the cluster copy still matches the
        // manifest
        if param.delta {
            match pg_read(pg, param)? {
                None => {
                    result.result = BackupCopyResult::Skip;
                }
                Some(mut reader) => {
                    let mut group = FilterGroup::new();
                    group.add(Box::new(HashFilter::new(HashType::Sha1)));
                    group.add(Box::new(SizeFilter::new()));
                    filter_io::drain(&mut reader, &mut group)?;

                    let pg_checksum = group_checksum(&group)?;
                    let pg_size = group_size(&group)?;

                    if pg_size == param.pg_file_size && pg_checksum == expected_checksum {
                        pg_file_match = true;

                        // Already referenced from a prior backup: no copy
                        if param.repo_file_has_reference {
                            result.result = BackupCopyResult::NoOp;
                            result.copy_size = pg_size;
                            result.copy_checksum = Some(pg_checksum);
                        }
                    }
                }
            }
        }

        // Check the repository copy unless it lives in a prior backup
        if !param.delta || !param.repo_file_has_reference {
            if result.result == BackupCopyResult::Skip {
                // The cluster dropped the file; remove the stale repo copy
                repo.remove(&repo_path, false)?;
            } else if (!param.delta || pg_file_match) && param.block_incr.is_none() {
                // A repo copy that fails to read, decrypt or decompress
                // must be recopied, not fail the backup
                match repo_verify(repo, &repo_path, param) {
                    Ok(Some((repo_checksum, repo_size)))
                        if repo_size == param.pg_file_size
                            && repo_checksum == expected_checksum =>
                    {
                        result.result = BackupCopyResult::Checksum;
                        result.copy_size = repo_size;
                        result.copy_checksum = Some(repo_checksum);
                    }
                    Ok(_) => result.result = BackupCopyResult::ReCopy,
                    Err(err) => {
                        debug!(file = param.pg_file, %err, "repo verify failed, recopy");
                        result.result = BackupCopyResult::ReCopy;
                    }
                }
            }
        }
    }

    // Copy the file
    if matches!(
        result.result,
        BackupCopyResult::Copy | BackupCopyResult::ReCopy
    ) {
        match pg_read(pg, param)? {
            // The cluster removed the file mid-backup
            None => result.result = BackupCopyResult::Skip,
            Some(mut reader) => {
                let mut group = FilterGroup::new();
                group.add(Box::new(HashFilter::new(HashType::Sha1)));
                group.add(Box::new(SizeFilter::new()));

                if param.pg_file_checksum_page {
                    group.add(Box::new(PageChecksumFilter::new(
                        param.segment_no,
                        PG_SEGMENT_PAGE_DEFAULT,
                        PG_PAGE_SIZE_DEFAULT,
                        param.pg_file_page_lsn_limit,
                    )));
                }

                match &param.block_incr {
                    Some(block_incr) => {
                        // Compression and encryption chain inside the
                        // super-blocks
                        let compress = if param.repo_compress.is_some() {
                            Some((param.repo_compress, param.repo_compress_level))
                        } else {
                            None
                        };

                        group.add(Box::new(BlockIncrFilter::new(BlockIncrParam {
                            block_size: block_incr.block_size as usize,
                            super_block_size: block_incr.super_block_size as usize,
                            checksum_size: block_incr.checksum_size,
                            reference: block_incr.reference,
                            bundle_id: 0,
                            bundle_offset: 0,
                            map_prior: block_incr.map_prior,
                            compress,
                            cipher_pass: param.cipher_pass,
                        })?));
                    }
                    None => {
                        if let Some(filter) =
                            compress_filter(param.repo_compress, param.repo_compress_level)?
                        {
                            group.add(filter);
                        }

                        if let Some(pass) = param.cipher_pass {
                            group.add(Box::new(CipherFilter::new(CipherMode::Encrypt, pass)));
                        }
                    }
                }

                // No atomic write: checksums are tested on resume after a
                // failed backup, and paths are synced at the end
                let mut writer = repo.new_write(&repo_path, WriteParam::new().create_path())?;
                let repo_size = filter_io::copy(&mut reader, &mut writer, &mut group)?;
                writer.close()?;

                result.repo_size = repo_size;
                result.copy_size = group_size(&group)?;
                result.copy_checksum = Some(group_checksum(&group)?);

                if param.pg_file_checksum_page {
                    result.page_checksum_result =
                        group.result(PAGE_CHECKSUM_FILTER_TYPE).cloned();
                }

                if param.block_incr.is_some() {
                    let pack = group.result(BLOCK_INCR_FILTER_TYPE).ok_or_else(|| {
                        BackupError::Assert(
                            "block incremental filter result missing".to_string(),
                        )
                    })?;

                    result.block_incr_map_size = Some(PackRead::new(pack).read_u64()?);
                }
            }
        }
    }

    // When the storage can hold files at a different size than written the
    // size at rest has to be read back after the copy; a checksum match
    // never had a write to measure
    if (matches!(
        result.result,
        BackupCopyResult::Copy | BackupCopyResult::ReCopy
    ) && repo.feature(StorageFeature::Compress))
        || result.result == BackupCopyResult::Checksum
    {
        result.repo_size = repo.info(&repo_path, true)?.size;
    }

    debug!(
        file = param.pg_file,
        result = ?result.result,
        copy_size = result.copy_size,
        repo_size = result.repo_size,
        "backup file"
    );

    Ok(result)
}
