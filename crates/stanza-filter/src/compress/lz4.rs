//! LZ4 compression filters
//!
//! Compression produces standard LZ4 frames with independent blocks, so a
//! repository file is readable by stock lz4 tooling. Decompression parses
//! the frame incrementally, block by block, which keeps memory bounded by
//! the frame's declared block size instead of the whole stream.

use lz4_flex::frame::{BlockMode, BlockSize, FrameEncoder, FrameInfo};
use stanza_pack::StringId;

use crate::buffer::Buffer;
use crate::error::{FilterError, Result};
use crate::{Filter, FilterType};

/// Filter type of [`Lz4CompressFilter`]
pub const LZ4_COMPRESS_FILTER_TYPE: FilterType = StringId::new("lz4-cmp");

/// Filter type of [`Lz4DecompressFilter`]
pub const LZ4_DECOMPRESS_FILTER_TYPE: FilterType = StringId::new("lz4-dcmp");

/// LZ4 frame magic, little endian
const LZ4_MAGIC: u32 = 0x184D_2204;

/// High bit of a block size word marks an uncompressed block
const BLOCK_UNCOMPRESSED: u32 = 0x8000_0000;

fn frame_info(level: i32) -> FrameInfo {
    // LZ4 has no effort dial; larger blocks trade memory for ratio
    let block_size = match level {
        i32::MIN..=3 => BlockSize::Max64KB,
        4..=6 => BlockSize::Max256KB,
        7..=8 => BlockSize::Max1MB,
        _ => BlockSize::Max4MB,
    };

    FrameInfo::new()
        .block_mode(BlockMode::Independent)
        .block_size(block_size)
        .content_checksum(false)
}

/// Streaming LZ4 frame compression.
pub struct Lz4CompressFilter {
    encoder: Option<FrameEncoder<Vec<u8>>>,
    pending: Vec<u8>,
    pending_offset: usize,
    input_same: bool,
    done: bool,
    flushed: bool,
}

impl Lz4CompressFilter {
    pub fn new(level: i32) -> Self {
        Self {
            encoder: Some(FrameEncoder::with_frame_info(frame_info(level), Vec::new())),
            pending: Vec::new(),
            pending_offset: 0,
            input_same: false,
            done: false,
            flushed: false,
        }
    }

    fn drain(&mut self, output: &mut Buffer) {
        let copied = output.extend_limited(&self.pending[self.pending_offset..]);
        self.pending_offset += copied;

        if self.pending_offset == self.pending.len() {
            self.pending.clear();
            self.pending_offset = 0;
            self.input_same = false;
            self.done = self.flushed;
        } else {
            self.input_same = true;
        }
    }
}

impl Filter for Lz4CompressFilter {
    fn filter_type(&self) -> FilterType {
        LZ4_COMPRESS_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        if self.input_same {
            self.drain(output);
            return Ok(());
        }

        match input {
            Some(input) => {
                let encoder = self.encoder.as_mut().ok_or_else(|| {
                    FilterError::Assert("lz4 compress filter used after flush".to_string())
                })?;

                use std::io::Write;
                encoder.write_all(input)?;
                self.pending.append(encoder.get_mut());
            }
            None => {
                if !self.flushed {
                    let encoder = self.encoder.take().ok_or_else(|| {
                        FilterError::Assert("lz4 compress filter flushed twice".to_string())
                    })?;

                    let inner = encoder.finish().map_err(|e| {
                        FilterError::Format(format!("unable to compress lz4 data: {e}"))
                    })?;

                    self.pending.extend_from_slice(&inner);
                    self.flushed = true;
                }
            }
        }

        self.drain(output);
        Ok(())
    }

    fn done(&self) -> bool {
        self.done && !self.input_same
    }

    fn input_same(&self) -> bool {
        self.input_same
    }
}

/// Frame parsing position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Magic,
    /// FLG and BD bytes
    Descriptor,
    /// Remaining descriptor bytes (content size, dict id, header checksum)
    DescriptorRest { extra: usize },
    /// Next block size word
    BlockSize,
    /// Block payload
    BlockData { compressed: bool, size: usize },
    /// Optional 4-byte checksum after a block
    BlockChecksum,
    /// Optional 4-byte checksum after the end mark
    ContentChecksum,
    Done,
}

/// Streaming LZ4 frame decompression.
///
/// Only frames with independent blocks are supported, which is what
/// [`Lz4CompressFilter`] produces. Block and content checksums are consumed
/// but not verified; corrupt data surfaces as a block decode failure or a
/// downstream checksum mismatch.
pub struct Lz4DecompressFilter {
    state: DecodeState,
    flags: u8,
    block_max: usize,
    /// Raw input accumulated until the current frame element is complete
    gather: Vec<u8>,
    pending: Vec<u8>,
    pending_offset: usize,
    input_same: bool,
    done: bool,
}

impl Lz4DecompressFilter {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Magic,
            flags: 0,
            block_max: 0,
            gather: Vec::new(),
            pending: Vec::new(),
            pending_offset: 0,
            input_same: false,
            done: false,
        }
    }

    fn drain(&mut self, output: &mut Buffer) {
        let copied = output.extend_limited(&self.pending[self.pending_offset..]);
        self.pending_offset += copied;

        if self.pending_offset == self.pending.len() {
            self.pending.clear();
            self.pending_offset = 0;
            self.input_same = false;
            self.done = self.state == DecodeState::Done;
        } else {
            self.input_same = true;
        }
    }

    /// Consume `need` bytes from the gather buffer when available.
    fn take(&mut self, need: usize) -> Option<Vec<u8>> {
        if self.gather.len() < need {
            return None;
        }

        Some(self.gather.drain(..need).collect())
    }

    fn parse(&mut self) -> Result<()> {
        loop {
            match self.state {
                DecodeState::Magic => {
                    let Some(bytes) = self.take(4) else { return Ok(()) };
                    let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

                    if magic != LZ4_MAGIC {
                        return Err(FilterError::Format(format!(
                            "invalid lz4 frame magic {magic:#010x}"
                        )));
                    }

                    self.state = DecodeState::Descriptor;
                }
                DecodeState::Descriptor => {
                    let Some(bytes) = self.take(2) else { return Ok(()) };
                    let flg = bytes[0];
                    let bd = bytes[1];

                    if flg >> 6 != 0b01 {
                        return Err(FilterError::Format(format!(
                            "unsupported lz4 frame version {}",
                            flg >> 6
                        )));
                    }

                    if flg & 0x20 == 0 {
                        return Err(FilterError::Format(
                            "lz4 linked block mode is not supported".to_string(),
                        ));
                    }

                    self.flags = flg;
                    self.block_max = match (bd >> 4) & 0x7 {
                        4 => 64 * 1024,
                        5 => 256 * 1024,
                        6 => 1024 * 1024,
                        7 => 4 * 1024 * 1024,
                        code => {
                            return Err(FilterError::Format(format!(
                                "invalid lz4 block size code {code}"
                            )));
                        }
                    };

                    // Content size (8), dict id (4), then the header checksum
                    let mut extra = 1;

                    if flg & 0x08 != 0 {
                        extra += 8;
                    }

                    if flg & 0x01 != 0 {
                        extra += 4;
                    }

                    self.state = DecodeState::DescriptorRest { extra };
                }
                DecodeState::DescriptorRest { extra } => {
                    if self.take(extra).is_none() {
                        return Ok(());
                    }

                    self.state = DecodeState::BlockSize;
                }
                DecodeState::BlockSize => {
                    let Some(bytes) = self.take(4) else { return Ok(()) };
                    let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

                    if word == 0 {
                        // End mark
                        self.state = if self.flags & 0x04 != 0 {
                            DecodeState::ContentChecksum
                        } else {
                            DecodeState::Done
                        };
                        continue;
                    }

                    let size = (word & !BLOCK_UNCOMPRESSED) as usize;

                    if size > self.block_max {
                        return Err(FilterError::Format(format!(
                            "lz4 block size {size} exceeds maximum {}",
                            self.block_max
                        )));
                    }

                    self.state = DecodeState::BlockData {
                        compressed: word & BLOCK_UNCOMPRESSED == 0,
                        size,
                    };
                }
                DecodeState::BlockData { compressed, size } => {
                    let Some(bytes) = self.take(size) else { return Ok(()) };

                    if compressed {
                        let decoded = lz4_flex::block::decompress(&bytes, self.block_max)
                            .map_err(|e| {
                                FilterError::Format(format!(
                                    "unable to decompress lz4 data: {e}"
                                ))
                            })?;
                        self.pending.extend_from_slice(&decoded);
                    } else {
                        self.pending.extend_from_slice(&bytes);
                    }

                    self.state = if self.flags & 0x10 != 0 {
                        DecodeState::BlockChecksum
                    } else {
                        DecodeState::BlockSize
                    };
                }
                DecodeState::BlockChecksum => {
                    if self.take(4).is_none() {
                        return Ok(());
                    }

                    self.state = DecodeState::BlockSize;
                }
                DecodeState::ContentChecksum => {
                    if self.take(4).is_none() {
                        return Ok(());
                    }

                    self.state = DecodeState::Done;
                }
                DecodeState::Done => return Ok(()),
            }
        }
    }
}

impl Default for Lz4DecompressFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Lz4DecompressFilter {
    fn filter_type(&self) -> FilterType {
        LZ4_DECOMPRESS_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        if self.input_same {
            self.drain(output);
            return Ok(());
        }

        match input {
            Some(input) => {
                if self.state != DecodeState::Done {
                    self.gather.extend_from_slice(input);
                    self.parse()?;
                }
            }
            None => {
                if self.state != DecodeState::Done {
                    return Err(FilterError::Format(
                        "unexpected eof in compressed data".to_string(),
                    ));
                }
            }
        }

        self.drain(output);
        Ok(())
    }

    fn done(&self) -> bool {
        self.done && !self.input_same
    }

    fn input_same(&self) -> bool {
        self.input_same
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn compress_all(level: i32, data: &[u8]) -> Vec<u8> {
        let mut compress = Lz4CompressFilter::new(level);
        let mut out = Buffer::new(data.len() + 4096);
        compress.process_in_out(Some(data), &mut out).unwrap();
        compress.process_in_out(None, &mut out).unwrap();
        assert!(compress.done());
        out.as_slice().to_vec()
    }

    #[test]
    fn one_byte_feeds_decode() {
        let data: Vec<u8> = (0u32..10_000).flat_map(|v| v.to_le_bytes()).collect();
        let compressed = compress_all(1, &data);

        let mut decompress = Lz4DecompressFilter::new();
        let mut decoded = Vec::new();
        let mut out = Buffer::new(96 * 1024);

        for byte in &compressed {
            loop {
                decompress
                    .process_in_out(Some(std::slice::from_ref(byte)), &mut out)
                    .unwrap();
                decoded.extend_from_slice(out.as_slice());
                out.clear();

                if !decompress.input_same() {
                    break;
                }
            }
        }

        decompress.process_in_out(None, &mut out).unwrap();
        decoded.extend_from_slice(out.as_slice());

        assert_eq!(decoded, data);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut decompress = Lz4DecompressFilter::new();
        let mut out = Buffer::new(1024);

        assert!(matches!(
            decompress.process_in_out(Some(b"\x00\x00\x00\x00rest"), &mut out),
            Err(FilterError::Format(_))
        ));
    }

    #[test]
    fn truncated_stream_fails_flush() {
        let compressed = compress_all(1, b"lz4 payload bytes");
        let truncated = &compressed[..compressed.len() - 4];

        let mut decompress = Lz4DecompressFilter::new();
        let mut out = Buffer::new(1024);
        decompress.process_in_out(Some(truncated), &mut out).unwrap();

        assert!(matches!(
            decompress.process_in_out(None, &mut out),
            Err(FilterError::Format(_))
        ));
    }
}
