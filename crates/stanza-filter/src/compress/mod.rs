//! Compression and decompression filters
//!
//! Four streaming algorithms behind one factory pair. Each filter holds the
//! backend's incremental state and obeys the group contract: consume what
//! fits, declare `input_same` when the output buffer fills first, finish
//! the stream on flush.

pub mod bz2;
pub mod gz;
pub mod lz4;
pub mod zst;

use crate::{Filter, Result};

/// Repository compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressType {
    #[default]
    None,
    Gz,
    Bz2,
    Lz4,
    Zst,
}

impl CompressType {
    pub const fn is_some(self) -> bool {
        !matches!(self, Self::None)
    }

    /// File extension appended to compressed repository files.
    pub const fn ext(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gz => ".gz",
            Self::Bz2 => ".bz2",
            Self::Lz4 => ".lz4",
            Self::Zst => ".zst",
        }
    }
}

/// Build the compression filter for `compress_type`, or `None` when
/// compression is off.
pub fn compress_filter(
    compress_type: CompressType,
    level: i32,
) -> Result<Option<Box<dyn Filter>>> {
    Ok(match compress_type {
        CompressType::None => None,
        CompressType::Gz => Some(Box::new(gz::GzCompressFilter::new(level))),
        CompressType::Bz2 => Some(Box::new(bz2::Bz2CompressFilter::new(level))),
        CompressType::Lz4 => Some(Box::new(lz4::Lz4CompressFilter::new(level))),
        CompressType::Zst => Some(Box::new(zst::ZstCompressFilter::new(level)?)),
    })
}

/// Build the decompression filter mirroring [`compress_filter`].
pub fn decompress_filter(compress_type: CompressType) -> Result<Option<Box<dyn Filter>>> {
    Ok(match compress_type {
        CompressType::None => None,
        CompressType::Gz => Some(Box::new(gz::GzDecompressFilter::new())),
        CompressType::Bz2 => Some(Box::new(bz2::Bz2DecompressFilter::new())),
        CompressType::Lz4 => Some(Box::new(lz4::Lz4DecompressFilter::new())),
        CompressType::Zst => Some(Box::new(zst::ZstDecompressFilter::new()?)),
    })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::group::FilterGroup;

    fn run_group(group: &mut FilterGroup, input: &[u8]) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut output = Buffer::new(333); // odd size to exercise backpressure

        loop {
            group.process(Some(input), &mut output).unwrap();
            collected.extend_from_slice(output.as_slice());
            output.clear();

            if !group.input_same() {
                break;
            }
        }

        while !group.done() {
            group.process(None, &mut output).unwrap();
            collected.extend_from_slice(output.as_slice());
            output.clear();
        }

        collected
    }

    fn round_trip(compress_type: CompressType, input: &[u8]) -> Vec<u8> {
        let mut compress_group = FilterGroup::new();
        compress_group.add(compress_filter(compress_type, 3).unwrap().unwrap());
        compress_group.open().unwrap();
        let compressed = run_group(&mut compress_group, input);
        compress_group.close().unwrap();

        let mut decompress_group = FilterGroup::new();
        decompress_group.add(decompress_filter(compress_type).unwrap().unwrap());
        decompress_group.open().unwrap();
        let decompressed = run_group(&mut decompress_group, &compressed);
        decompress_group.close().unwrap();

        decompressed
    }

    fn sample_data() -> Vec<u8> {
        // Compressible but not trivial: repeated phrase with a counter
        let mut data = Vec::new();
        for idx in 0u32..2000 {
            data.extend_from_slice(format!("block {idx} of the sample stream\n").as_bytes());
        }
        data
    }

    #[test]
    fn gz_round_trip() {
        let data = sample_data();
        assert_eq!(round_trip(CompressType::Gz, &data), data);
    }

    #[test]
    fn bz2_round_trip() {
        let data = sample_data();
        assert_eq!(round_trip(CompressType::Bz2, &data), data);
    }

    #[test]
    fn lz4_round_trip() {
        let data = sample_data();
        assert_eq!(round_trip(CompressType::Lz4, &data), data);
    }

    #[test]
    fn zst_round_trip() {
        let data = sample_data();
        assert_eq!(round_trip(CompressType::Zst, &data), data);
    }

    #[test]
    fn empty_stream_round_trips() {
        for compress_type in [
            CompressType::Gz,
            CompressType::Bz2,
            CompressType::Lz4,
            CompressType::Zst,
        ] {
            assert_eq!(round_trip(compress_type, b""), b"");
        }
    }

    #[test]
    fn none_produces_no_filter() {
        assert!(compress_filter(CompressType::None, 3).unwrap().is_none());
        assert!(decompress_filter(CompressType::None).unwrap().is_none());
    }

    #[test]
    fn extensions() {
        assert_eq!(CompressType::None.ext(), "");
        assert_eq!(CompressType::Gz.ext(), ".gz");
        assert_eq!(CompressType::Zst.ext(), ".zst");
    }
}
