//! Block map
//!
//! A sorted, positional array where index `i` records where the `i`-th
//! logical block of a file is physically located. Written once per file per
//! backup, read by both restore and the next backup. Entries from the same
//! reference and bundle with touching offsets describe adjacent
//! super-blocks, which the delta engine fuses into single reads.

use stanza_pack::{PackRead, PackWrite};

use crate::error::Result;

/// One block map entry per logical block.
///
/// `reference` names the backup that physically holds the block's
/// super-block, `bundle_id` the bundle within it when many small files
/// share a physical file, `offset` the absolute byte position of the
/// super-block in the referenced object and `size` its on-disk (framed)
/// size. The checksum is the block's SHA-1, possibly truncated to the
/// configured checksum size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMapItem {
    pub reference: u32,
    pub bundle_id: u64,
    pub offset: u64,
    pub size: u64,
    pub checksum: Vec<u8>,
}

/// The ordered sequence of block map entries for one file.
///
/// Invariant: `len() == ceil(file_size / block_size)`. The block number is
/// the array index; entries are never reordered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    items: Vec<BlockMapItem>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deserialize a map from the bytes that trail a repository file.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut read = PackRead::from_slice(data);
        let mut items = Vec::new();

        read.array_begin()?;

        while read.next()? {
            read.obj_begin()?;

            items.push(BlockMapItem {
                reference: read.read_u32()?,
                bundle_id: read.read_u64()?,
                offset: read.read_u64()?,
                size: read.read_u64()?,
                checksum: read.read_bin()?,
            });

            read.obj_end()?;
        }

        read.array_end()?;
        read.end()?;

        Ok(Self { items })
    }

    /// Serialize for appending after the super-block bodies.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut write = PackWrite::new();
        write.array_begin()?;

        for item in &self.items {
            write.obj_begin()?;
            write.write_u32(item.reference)?;
            write.write_u64(item.bundle_id)?;
            write.write_u64(item.offset)?;
            write.write_u64(item.size)?;
            write.write_bin(&item.checksum)?;
            write.obj_end()?;
        }

        write.array_end()?;
        Ok(write.end()?.into_vec())
    }

    pub fn add(&mut self, item: BlockMapItem) {
        self.items.push(item);
    }

    pub fn get(&self, block_no: usize) -> Option<&BlockMapItem> {
        self.items.get(block_no)
    }

    pub fn get_mut(&mut self, block_no: usize) -> Option<&mut BlockMapItem> {
        self.items.get_mut(block_no)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockMapItem> {
        self.items.iter()
    }
}

impl<'a> IntoIterator for &'a BlockMap {
    type Item = &'a BlockMapItem;
    type IntoIter = std::slice::Iter<'a, BlockMapItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_map() -> BlockMap {
        let mut map = BlockMap::new();

        map.add(BlockMapItem {
            reference: 1,
            bundle_id: 0,
            offset: 0,
            size: 8200,
            checksum: vec![0x11; 20],
        });
        map.add(BlockMapItem {
            reference: 1,
            bundle_id: 0,
            offset: 8200,
            size: 8200,
            checksum: vec![0x22; 20],
        });
        map.add(BlockMapItem {
            reference: 2,
            bundle_id: 7,
            offset: 0,
            size: 4100,
            checksum: vec![0x33; 20],
        });

        map
    }

    #[test]
    fn round_trip() {
        let map = sample_map();
        let bytes = map.to_bytes().unwrap();
        let decoded = BlockMap::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, map);
    }

    #[test]
    fn empty_map_round_trips() {
        let map = BlockMap::new();
        let decoded = BlockMap::from_bytes(&map.to_bytes().unwrap()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn zero_fields_survive_default_elision() {
        // reference 0, bundle 0, offset 0 are all defaults and elided on
        // the wire; they must still decode
        let mut map = BlockMap::new();
        map.add(BlockMapItem {
            reference: 0,
            bundle_id: 0,
            offset: 0,
            size: 10,
            checksum: vec![0xaa; 5],
        });

        let decoded = BlockMap::from_bytes(&map.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get(0).unwrap().reference, 0);
        assert_eq!(decoded.get(0).unwrap().bundle_id, 0);
        assert_eq!(decoded.get(0).unwrap().offset, 0);
        assert_eq!(decoded.get(0).unwrap().checksum, vec![0xaa; 5]);
    }

    #[test]
    fn truncated_checksums_round_trip() {
        let mut map = BlockMap::new();
        map.add(BlockMapItem {
            reference: 3,
            bundle_id: 0,
            offset: 16,
            size: 99,
            checksum: vec![0xcd; 7],
        });

        let decoded = BlockMap::from_bytes(&map.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get(0).unwrap().checksum.len(), 7);
    }
}
