//! Block delta
//!
//! Given a block map (the state we want) and optionally a delta map (the
//! checksums of what the destination already has), compute the minimal
//! ordered set of physical reads needed and then stream the (file offset,
//! block bytes) writes that bring the destination up to date.
//!
//! Plan shape: reads grouped by (reference, bundle, offset) with touching
//! physical ranges coalesced, each read containing one or more
//! super-blocks, each super-block naming the records to extract. Records
//! not named are read and discarded, since a super-block must be consumed
//! sequentially.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;

use tracing::debug;
use zeroize::Zeroizing;

use stanza_crypto::CipherMode;
use stanza_filter::cipher::CipherFilter;
use stanza_filter::{ChunkedReader, CompressType, FilterGroup, FilteredReader, decompress_filter};
use stanza_pack::varint;

use crate::error::{BlockError, Result};
use crate::map::BlockMap;

/// One write to apply to the destination file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeltaWrite {
    /// Absolute offset in the destination file
    pub offset: u64,
    pub block: Vec<u8>,
}

/// One block to extract from a super-block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeltaBlock {
    /// Record index within the physical super-block
    pub no: u64,
    /// Absolute offset in the destination file
    pub offset: u64,
    /// Expected block checksum from the block map
    pub checksum: Vec<u8>,
}

/// One physical super-block within a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeltaSuperBlock {
    /// On-disk (framed) size of the super-block
    pub size: u64,
    pub blocks: Vec<BlockDeltaBlock>,
}

/// One contiguous repository read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeltaRead {
    pub reference: u32,
    pub bundle_id: u64,
    /// Offset of the first super-block within the referenced object
    pub offset: u64,
    /// Total on-disk bytes covered by this read
    pub size: u64,
    pub super_blocks: Vec<BlockDeltaSuperBlock>,
}

/// Execution plan plus the iterator that applies it.
///
/// Drive with [`BlockDelta::next`] in plan order: for each read entry open
/// a repository stream at (reference, bundle, offset, size) and call
/// `next` until it returns `None`, applying each yielded write.
pub struct BlockDelta {
    reads: Vec<BlockDeltaRead>,
    block_size: u64,
    compress: Option<CompressType>,
    cipher_pass: Option<Zeroizing<Vec<u8>>>,

    super_block_idx: usize,
    block_idx: usize,
    record_no: u64,
    records: Vec<u8>,
    records_pos: usize,
    records_loaded: bool,
}

impl BlockDelta {
    /// Construct the plan.
    ///
    /// `delta_map` is the flat concatenation of destination block
    /// checksums, each `checksum_size` bytes, or `None` for a fresh
    /// restore. Its length need not match the block map: blocks beyond it
    /// are treated as needed.
    pub fn new(
        block_map: &BlockMap,
        block_size: u64,
        checksum_size: usize,
        delta_map: Option<&[u8]>,
        compress: Option<CompressType>,
        cipher_pass: Option<&[u8]>,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(BlockError::Assert("block size may not be zero".to_string()));
        }

        if checksum_size == 0 {
            return Err(BlockError::Assert(
                "checksum size may not be zero".to_string(),
            ));
        }

        let delta_count = delta_map.map_or(0, |map| map.len() / checksum_size);

        // Record index of each map entry within its super-block: the count
        // of earlier entries naming the same physical super-block
        let mut record_counter: HashMap<(u32, u64, u64), u64> = HashMap::new();
        let mut record_of = vec![0u64; block_map.len()];

        // Blocks that must be fetched, grouped by reference
        let mut reference_blocks: BTreeMap<u32, Vec<usize>> = BTreeMap::new();

        for (map_idx, item) in block_map.iter().enumerate() {
            if item.checksum.len() != checksum_size {
                return Err(BlockError::Assert(format!(
                    "block map checksum size {} does not match {checksum_size}",
                    item.checksum.len()
                )));
            }

            let counter = record_counter
                .entry((item.reference, item.bundle_id, item.offset))
                .or_insert(0);
            record_of[map_idx] = *counter;
            *counter += 1;

            // Needed when beyond the delta map or the checksum differs
            let needed = map_idx >= delta_count
                || delta_map.is_none_or(|map| {
                    item.checksum != map[map_idx * checksum_size..(map_idx + 1) * checksum_size]
                });

            if needed {
                reference_blocks
                    .entry(item.reference)
                    .or_default()
                    .push(map_idx);
            }
        }

        // Newest references tend to hold the most changed blocks, so fetch
        // them first
        let mut reads: Vec<BlockDeltaRead> = Vec::new();

        for (&reference, block_idxs) in reference_blocks.iter().rev() {
            let mut sorted = block_idxs.clone();
            sorted.sort_by_key(|&idx| {
                block_map
                    .get(idx)
                    .map_or((0, 0, idx), |item| (item.bundle_id, item.offset, idx))
            });

            let mut prior: Option<usize> = None;

            for &map_idx in &sorted {
                let Some(item) = block_map.get(map_idx) else {
                    continue;
                };

                // New read unless this super-block touches the prior one
                let new_read = match prior.and_then(|idx| block_map.get(idx)) {
                    None => true,
                    Some(prior_item) => {
                        prior_item.bundle_id != item.bundle_id
                            || (prior_item.offset != item.offset
                                && prior_item.offset + prior_item.size != item.offset)
                    }
                };

                if new_read {
                    reads.push(BlockDeltaRead {
                        reference,
                        bundle_id: item.bundle_id,
                        offset: item.offset,
                        size: 0,
                        super_blocks: Vec::new(),
                    });
                }

                // New super-block at every distinct offset
                let new_super_block = new_read
                    || prior
                        .and_then(|idx| block_map.get(idx))
                        .is_none_or(|prior_item| prior_item.offset != item.offset);

                // A read was just pushed or exists from a prior iteration
                #[allow(clippy::unwrap_used)]
                let read = reads.last_mut().unwrap();

                if new_super_block {
                    read.super_blocks.push(BlockDeltaSuperBlock {
                        size: item.size,
                        blocks: Vec::new(),
                    });
                    read.size += item.size;
                }

                #[allow(clippy::unwrap_used)]
                read.super_blocks
                    .last_mut()
                    .unwrap()
                    .blocks
                    .push(BlockDeltaBlock {
                        no: record_of[map_idx],
                        offset: map_idx as u64 * block_size,
                        checksum: item.checksum.clone(),
                    });

                prior = Some(map_idx);
            }
        }

        debug!(
            reads = reads.len(),
            blocks = reads
                .iter()
                .flat_map(|r| &r.super_blocks)
                .map(|s| s.blocks.len())
                .sum::<usize>(),
            "block delta plan built"
        );

        Ok(Self {
            reads,
            block_size,
            compress,
            cipher_pass: cipher_pass.map(|pass| Zeroizing::new(pass.to_vec())),
            super_block_idx: 0,
            block_idx: 0,
            record_no: 0,
            records: Vec::new(),
            records_pos: 0,
            records_loaded: false,
        })
    }

    /// The ordered reads to perform.
    pub fn reads(&self) -> &[BlockDeltaRead] {
        &self.reads
    }

    /// Unwrap the next super-block body from the repository stream.
    fn super_block_load(&mut self, read_io: &mut dyn Read) -> Result<()> {
        let mut group = FilterGroup::new();

        if let Some(pass) = &self.cipher_pass {
            group.add(Box::new(CipherFilter::new(CipherMode::Decrypt, pass)));
        }

        if let Some(compress_type) = self.compress {
            if let Some(filter) = decompress_filter(compress_type)? {
                group.add(filter);
            }
        }

        let chunked = ChunkedReader::new(read_io);
        let mut reader = FilteredReader::new(chunked, group)?;

        self.records.clear();
        reader.read_to_end(&mut self.records)?;

        // The decompressor may finish before the part terminator has been
        // consumed; drain the framing so the stream sits at the next
        // super-block
        let (mut chunked, _group) = reader.into_parts();
        std::io::copy(&mut chunked, &mut std::io::sink())?;

        self.records_pos = 0;
        self.record_no = 0;
        self.block_idx = 0;
        self.records_loaded = true;
        Ok(())
    }

    /// Produce the next write for `read`, consuming `read_io` as needed.
    ///
    /// Returns `None` when the read is exhausted; the iterator then resets
    /// so the caller can move to the next read in plan order.
    pub fn next(
        &mut self,
        read: &BlockDeltaRead,
        read_io: &mut dyn Read,
    ) -> Result<Option<BlockDeltaWrite>> {
        loop {
            if self.super_block_idx >= read.super_blocks.len() {
                self.super_block_idx = 0;
                self.records_loaded = false;
                self.records.clear();
                return Ok(None);
            }

            if !self.records_loaded {
                self.super_block_load(read_io)?;
            }

            let super_block = &read.super_blocks[self.super_block_idx];

            // Super-block consumed: all listed blocks must have been found
            if self.records_pos >= self.records.len() {
                if self.block_idx < super_block.blocks.len() {
                    return Err(BlockError::Assert(format!(
                        "super block ended with {} block(s) missing",
                        super_block.blocks.len() - self.block_idx
                    )));
                }

                self.super_block_idx += 1;
                self.records_loaded = false;
                continue;
            }

            // All listed blocks extracted; discard the remaining records
            if self.block_idx >= super_block.blocks.len() {
                self.super_block_idx += 1;
                self.records_loaded = false;
                continue;
            }

            // One record: the stored-block delta, then the block bytes.
            // Only the final record of a file may be short.
            let mut pos = self.records_pos;
            let _block_delta = varint::read_u64(&self.records, &mut pos)?;

            let take = (self.block_size as usize).min(self.records.len() - pos);
            let block = self.records[pos..pos + take].to_vec();
            self.records_pos = pos + take;

            let record_no = self.record_no;
            self.record_no += 1;

            if super_block.blocks[self.block_idx].no == record_no {
                let offset = super_block.blocks[self.block_idx].offset;
                self.block_idx += 1;

                return Ok(Some(BlockDeltaWrite { offset, block }));
            }

            // Not in the plan: read and discarded
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::map::BlockMapItem;
    use pretty_assertions::assert_eq;

    fn item(reference: u32, bundle_id: u64, offset: u64, size: u64, seed: u8) -> BlockMapItem {
        BlockMapItem {
            reference,
            bundle_id,
            offset,
            size,
            checksum: vec![seed; 20],
        }
    }

    #[test]
    fn fresh_restore_needs_every_block() {
        let mut map = BlockMap::new();
        map.add(item(1, 0, 0, 100, 0x01));
        map.add(item(1, 0, 100, 100, 0x02));

        let delta = BlockDelta::new(&map, 8192, 20, None, None, None).unwrap();

        assert_eq!(delta.reads().len(), 1);
        assert_eq!(delta.reads()[0].super_blocks.len(), 2);
        assert_eq!(delta.reads()[0].size, 200);
    }

    #[test]
    fn matching_delta_map_needs_nothing() {
        let mut map = BlockMap::new();
        map.add(item(1, 0, 0, 100, 0x01));
        map.add(item(1, 0, 100, 100, 0x02));

        let mut delta_map = vec![0x01u8; 20];
        delta_map.extend_from_slice(&[0x02; 20]);

        let delta = BlockDelta::new(&map, 8192, 20, Some(&delta_map), None, None).unwrap();
        assert!(delta.reads().is_empty());
    }

    #[test]
    fn adjacent_super_blocks_coalesce_into_one_read() {
        // Ten blocks in one reference, sizes 8200, offsets touching.
        // Delta map matches blocks 0..4; 5..9 must be fetched as one read
        // at offset 41000 with five super-blocks.
        let mut map = BlockMap::new();
        let mut delta_map = Vec::new();

        for idx in 0u8..10 {
            map.add(item(1, 1, u64::from(idx) * 8200, 8200, idx));
            if idx < 5 {
                delta_map.extend_from_slice(&[idx; 20]);
            } else {
                delta_map.extend_from_slice(&[0xff; 20]);
            }
        }

        let delta = BlockDelta::new(&map, 8192, 20, Some(&delta_map), None, None).unwrap();

        assert_eq!(delta.reads().len(), 1);
        let read = &delta.reads()[0];
        assert_eq!(read.reference, 1);
        assert_eq!(read.bundle_id, 1);
        assert_eq!(read.offset, 41000);
        assert_eq!(read.size, 5 * 8200);
        assert_eq!(read.super_blocks.len(), 5);

        for super_block in &read.super_blocks {
            assert_eq!(super_block.blocks.len(), 1);
        }
    }

    #[test]
    fn references_are_visited_newest_first() {
        let mut map = BlockMap::new();
        map.add(item(1, 0, 0, 50, 0x01));
        map.add(item(3, 0, 0, 50, 0x02));
        map.add(item(2, 0, 0, 50, 0x03));

        let delta = BlockDelta::new(&map, 8192, 20, None, None, None).unwrap();

        let order: Vec<u32> = delta.reads().iter().map(|r| r.reference).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn same_offset_blocks_share_a_super_block() {
        // Two blocks stored in the same physical super-block
        let mut map = BlockMap::new();
        map.add(item(1, 0, 0, 300, 0x01));
        map.add(item(1, 0, 0, 300, 0x02));

        let delta = BlockDelta::new(&map, 8192, 20, None, None, None).unwrap();

        assert_eq!(delta.reads().len(), 1);
        assert_eq!(delta.reads()[0].super_blocks.len(), 1);
        assert_eq!(delta.reads()[0].super_blocks[0].blocks.len(), 2);
        assert_eq!(delta.reads()[0].super_blocks[0].blocks[0].no, 0);
        assert_eq!(delta.reads()[0].super_blocks[0].blocks[1].no, 1);
        assert_eq!(delta.reads()[0].size, 300);
    }

    #[test]
    fn short_delta_map_marks_trailing_blocks_needed() {
        let mut map = BlockMap::new();
        map.add(item(1, 0, 0, 100, 0x01));
        map.add(item(1, 0, 100, 100, 0x02));

        // Delta map only covers block 0, and it matches
        let delta_map = vec![0x01u8; 20];
        let delta = BlockDelta::new(&map, 8192, 20, Some(&delta_map), None, None).unwrap();

        assert_eq!(delta.reads().len(), 1);
        assert_eq!(delta.reads()[0].offset, 100);
        assert_eq!(delta.reads()[0].super_blocks.len(), 1);
    }
}
