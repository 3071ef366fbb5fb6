//! Block incremental filter
//!
//! Builds the super-block list and block map for one file, either from the
//! file alone (the first backup) or from the file and a prior map (each
//! subsequent backup). Super-blocks are stored first and the block map
//! second; the filter's result is the stored map size so the map can be
//! located without scanning.
//!
//! Super-blocks batch multiple changed blocks into one compression and
//! encryption stream, which improves the compression ratio at the cost of
//! sequential reads within a super-block. For large block sizes the super
//! block size will usually equal the block size to negate the read
//! penalty.
//!
//! Block checksums are SHA-1 truncated to a configured width. At least
//! five bytes are kept even for the smallest blocks since the comparison
//! looks for changes, not just corruption; a collision that hides a change
//! is almost certainly caught by the file-level checksum, failing the
//! backup rather than restoring corrupt data.

use std::io::Cursor;

use tracing::trace;
use zeroize::Zeroizing;

use stanza_crypto::{CipherMode, HashType, hash_one};
use stanza_filter::cipher::CipherFilter;
use stanza_filter::{
    Buffer, ChunkedWriter, CompressType, Filter, FilterGroup, FilterType, compress_filter,
    io as filter_io,
};
use stanza_pack::{Pack, PackWrite, StringId, varint};

use crate::error::{BlockError, Result};
use crate::map::{BlockMap, BlockMapItem};

/// Filter type of [`BlockIncrFilter`]
pub const BLOCK_INCR_FILTER_TYPE: FilterType = StringId::new("blk-incr");

/// Narrowest allowed block checksum
pub const BLOCK_CHECKSUM_SIZE_MIN: usize = 5;

/// Widest block checksum (a full SHA-1)
pub const BLOCK_CHECKSUM_SIZE_MAX: usize = 20;

/// Default checksum width for a block size.
///
/// Larger blocks mean fewer checksums per file, so a stronger checksum
/// costs proportionally less.
pub fn block_checksum_size(block_size: u64) -> usize {
    let bits = 64 - block_size.leading_zeros() as usize;
    bits.saturating_sub(9)
        .clamp(BLOCK_CHECKSUM_SIZE_MIN, BLOCK_CHECKSUM_SIZE_MAX)
}

/// Construction parameters for [`BlockIncrFilter`].
pub struct BlockIncrParam<'a> {
    pub block_size: usize,
    pub super_block_size: usize,
    pub checksum_size: usize,
    /// Reference of the backup being written
    pub reference: u32,
    pub bundle_id: u64,
    /// Offset already written to the bundle before this file
    pub bundle_offset: u64,
    /// Serialized prior map, when one exists and was built with the same
    /// block size
    pub map_prior: Option<&'a [u8]>,
    pub compress: Option<(CompressType, i32)>,
    pub cipher_pass: Option<&'a [u8]>,
}

/// Segments the input stream into blocks, stores changed blocks wrapped in
/// super-blocks and appends a fresh block map at end of stream.
pub struct BlockIncrFilter {
    block_size: usize,
    super_block_size: usize,
    checksum_size: usize,
    reference: u32,
    bundle_id: u64,
    bundle_offset: u64,

    block_no: u64,
    /// Last stored block number; record headers store the delta so they
    /// compress well
    block_no_last: u64,
    /// Offset of the next super-block within the bundle
    block_offset: u64,

    block: Vec<u8>,
    super_block: Vec<u8>,
    /// Indices of map entries waiting for this super-block's offset/size
    super_block_entries: Vec<usize>,

    map_prior: Option<BlockMap>,
    map_out: BlockMap,
    map_size: u64,

    compress: Option<(CompressType, i32)>,
    cipher_pass: Option<Zeroizing<Vec<u8>>>,

    /// Super-block bodies and trailing map waiting to be drained
    out: Vec<u8>,
    out_offset: usize,
    input_offset: usize,
    input_same: bool,
    done: bool,
    finished: bool,
}

impl BlockIncrFilter {
    pub fn new(param: BlockIncrParam<'_>) -> Result<Self> {
        if param.block_size == 0 {
            return Err(BlockError::Assert("block size may not be zero".to_string()));
        }

        if !(BLOCK_CHECKSUM_SIZE_MIN..=BLOCK_CHECKSUM_SIZE_MAX).contains(&param.checksum_size) {
            return Err(BlockError::Assert(format!(
                "checksum size {} not in [{BLOCK_CHECKSUM_SIZE_MIN}, {BLOCK_CHECKSUM_SIZE_MAX}]",
                param.checksum_size
            )));
        }

        let map_prior = match param.map_prior {
            None => None,
            Some(bytes) => {
                let map = BlockMap::from_bytes(bytes)?;

                // A prior map built with a different checksum width implies
                // a different configuration; the caller must pass a map
                // generated with the same block size and checksum size
                if let Some(item) = map.iter().next() {
                    if item.checksum.len() != param.checksum_size {
                        return Err(BlockError::Assert(format!(
                            "prior map checksum size {} does not match {}",
                            item.checksum.len(),
                            param.checksum_size
                        )));
                    }
                }

                Some(map)
            }
        };

        Ok(Self {
            block_size: param.block_size,
            super_block_size: param.super_block_size.max(param.block_size),
            checksum_size: param.checksum_size,
            reference: param.reference,
            bundle_id: param.bundle_id,
            bundle_offset: param.bundle_offset,
            block_no: 0,
            block_no_last: 0,
            block_offset: param.bundle_offset,
            block: Vec::with_capacity(param.block_size),
            super_block: Vec::new(),
            super_block_entries: Vec::new(),
            map_prior,
            map_out: BlockMap::new(),
            map_size: 0,
            compress: param.compress,
            cipher_pass: param.cipher_pass.map(|pass| Zeroizing::new(pass.to_vec())),
            out: Vec::new(),
            out_offset: 0,
            input_offset: 0,
            input_same: false,
            done: false,
            finished: false,
        })
    }

    /// Wrap a super-block payload through the chained compression and
    /// encryption filters.
    fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut group = FilterGroup::new();

        if let Some((compress_type, level)) = self.compress {
            if let Some(filter) = compress_filter(compress_type, level)? {
                group.add(filter);
            }
        }

        if let Some(pass) = &self.cipher_pass {
            group.add(Box::new(CipherFilter::new(CipherMode::Encrypt, pass)));
        }

        let mut wrapped = Vec::new();
        filter_io::copy(&mut Cursor::new(payload), &mut wrapped, &mut group)?;
        Ok(wrapped)
    }

    /// Close the open super-block: wrap it, frame it into the output and
    /// fix up the map entries that point at it.
    fn super_block_close(&mut self) -> Result<()> {
        if self.super_block_entries.is_empty() {
            return Ok(());
        }

        let payload = std::mem::take(&mut self.super_block);
        let wrapped = self.wrap(&payload)?;

        let framed_start = self.out.len();
        let mut writer = ChunkedWriter::new(&mut self.out);
        writer.write(&wrapped);
        writer.finish();
        let framed_size = (self.out.len() - framed_start) as u64;

        trace!(
            blocks = self.super_block_entries.len(),
            offset = self.block_offset,
            size = framed_size,
            "super block stored"
        );

        for map_idx in self.super_block_entries.drain(..) {
            if let Some(item) = self.map_out.get_mut(map_idx) {
                item.offset = self.block_offset;
                item.size = framed_size;
            }
        }

        self.block_offset += framed_size;
        Ok(())
    }

    /// Checksum the accumulated block and either reference the prior
    /// backup's copy or store it in the open super-block.
    fn block_process(&mut self) -> Result<()> {
        let checksum_full = hash_one(HashType::Sha1, &self.block);
        let checksum = &checksum_full[..self.checksum_size];

        let prior_item = self
            .map_prior
            .as_ref()
            .and_then(|map| map.get(self.block_no as usize));

        match prior_item {
            // Unchanged: the bytes already live in a prior backup
            Some(item) if item.checksum == checksum => {
                self.map_out.add(item.clone());
            }
            // Changed, new, or beyond the prior map: store it
            _ => {
                varint::write_u64(&mut self.super_block, self.block_no - self.block_no_last);
                self.super_block.extend_from_slice(&self.block);
                self.block_no_last = self.block_no;

                // Offset and size are filled in when the super-block closes
                self.map_out.add(BlockMapItem {
                    reference: self.reference,
                    bundle_id: self.bundle_id,
                    offset: 0,
                    size: 0,
                    checksum: checksum.to_vec(),
                });
                self.super_block_entries.push(self.map_out.len() - 1);

                if self.super_block.len() + self.block_size > self.super_block_size {
                    self.super_block_close()?;
                }
            }
        }

        self.block_no += 1;
        self.block.clear();
        Ok(())
    }

    /// End of input: close any open super-block and append the block map.
    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        self.super_block_close()?;

        if self.block_no > 0 {
            let map_bytes = self.map_out.to_bytes()?;
            self.map_size = map_bytes.len() as u64;
            self.out.extend_from_slice(&map_bytes);
        }

        self.finished = true;
        Ok(())
    }

    /// The output block map, for tests and local callers. Complete once the
    /// filter is done.
    pub fn map(&self) -> &BlockMap {
        &self.map_out
    }
}

impl Filter for BlockIncrFilter {
    fn filter_type(&self) -> FilterType {
        BLOCK_INCR_FILTER_TYPE
    }

    fn process_in_out(
        &mut self,
        input: Option<&[u8]>,
        output: &mut Buffer,
    ) -> stanza_filter::Result<()> {
        self.done = input.is_none();

        // Loop until the input is consumed or there is output
        loop {
            // Accumulate input into the current block
            if !self.done && self.block.len() < self.block_size {
                if let Some(input) = input {
                    let source = &input[self.input_offset..];
                    let need = self.block_size - self.block.len();

                    if source.len() <= need {
                        self.block.extend_from_slice(source);
                        self.input_offset = 0;
                        self.input_same = false;
                    } else {
                        self.block.extend_from_slice(&source[..need]);
                        self.input_offset += need;
                        self.input_same = true;
                    }
                }
            }

            // On a full block (or final partial block) decide its fate
            if self.done || self.block.len() == self.block_size {
                if self.out.is_empty() {
                    if !self.block.is_empty() {
                        self.block_process().map_err(to_filter_error)?;
                    }

                    if self.done {
                        self.finish().map_err(to_filter_error)?;
                    }
                }

                // Drain pending output into the group buffer
                let pending = self.out.len() - self.out_offset;

                if pending > 0 {
                    let copied = output.extend_limited(&self.out[self.out_offset..]);

                    if copied == pending {
                        self.out.clear();
                        self.out_offset = 0;
                        self.input_same = self.input_offset != 0;
                    } else {
                        self.out_offset += copied;
                        self.input_same = true;
                    }
                }
            }

            if !(self.input_same && output.is_empty()) {
                break;
            }
        }

        Ok(())
    }

    fn done(&self) -> bool {
        self.done && !self.input_same
    }

    fn input_same(&self) -> bool {
        self.input_same
    }

    fn result(&mut self) -> stanza_filter::Result<Option<Pack>> {
        let mut pack = PackWrite::new();
        pack.write_u64(self.map_size)
            .map_err(stanza_filter::FilterError::from)?;

        Ok(Some(pack.end().map_err(stanza_filter::FilterError::from)?))
    }

    fn param(&self) -> stanza_filter::Result<Option<Pack>> {
        let build = || -> stanza_pack::Result<Pack> {
            let mut pack = PackWrite::new();
            pack.write_u64(self.block_size as u64)?;
            pack.write_u64(self.super_block_size as u64)?;
            pack.write_u64(self.checksum_size as u64)?;
            pack.write_u32(self.reference)?;
            pack.write_u64(self.bundle_id)?;
            pack.write_u64(self.bundle_offset)?;
            pack.end()
        };

        Ok(Some(build().map_err(stanza_filter::FilterError::from)?))
    }
}

fn to_filter_error(err: BlockError) -> stanza_filter::FilterError {
    match err {
        BlockError::Filter(inner) => inner,
        other => stanza_filter::FilterError::Format(other.to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn checksum_size_defaults() {
        assert_eq!(block_checksum_size(8192), 5);
        assert_eq!(block_checksum_size(128 * 1024), 9);
        assert_eq!(block_checksum_size(1024 * 1024), 12);
        assert_eq!(block_checksum_size(u64::MAX), 20);
    }
}
