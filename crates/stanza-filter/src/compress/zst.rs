//! Zstandard compression filters

use stanza_pack::StringId;
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

use crate::buffer::Buffer;
use crate::error::{FilterError, Result};
use crate::{Filter, FilterType};

/// Filter type of [`ZstCompressFilter`]
pub const ZST_COMPRESS_FILTER_TYPE: FilterType = StringId::new("zst-cmp");

/// Filter type of [`ZstDecompressFilter`]
pub const ZST_DECOMPRESS_FILTER_TYPE: FilterType = StringId::new("zst-dcmp");

/// Streaming Zstandard compression.
pub struct ZstCompressFilter {
    encoder: Encoder<'static>,
    input_offset: usize,
    input_same: bool,
    done: bool,
}

impl ZstCompressFilter {
    pub fn new(level: i32) -> Result<Self> {
        Ok(Self {
            encoder: Encoder::new(level.clamp(1, 22))
                .map_err(|e| FilterError::Format(format!("unable to create zst encoder: {e}")))?,
            input_offset: 0,
            input_same: false,
            done: false,
        })
    }
}

impl Filter for ZstCompressFilter {
    fn filter_type(&self) -> FilterType {
        ZST_COMPRESS_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        match input {
            Some(input) => {
                let source = &input[self.input_offset..];
                let mut in_buffer = InBuffer::around(source);

                output.extend_with(|out| {
                    let mut out_buffer = OutBuffer::around(out);
                    self.encoder
                        .run(&mut in_buffer, &mut out_buffer)
                        .map_err(|e| {
                            FilterError::Format(format!("unable to compress zst data: {e}"))
                        })?;
                    Ok::<_, FilterError>(out_buffer.pos())
                })?;

                self.input_offset += in_buffer.pos;

                if self.input_offset == input.len() {
                    self.input_offset = 0;
                    self.input_same = false;
                } else {
                    self.input_same = true;
                }
            }
            None => {
                let mut remaining = 0;

                output.extend_with(|out| {
                    let mut out_buffer = OutBuffer::around(out);
                    remaining = self.encoder.finish(&mut out_buffer, true).map_err(|e| {
                        FilterError::Format(format!("unable to compress zst data: {e}"))
                    })?;
                    Ok::<_, FilterError>(out_buffer.pos())
                })?;

                if remaining == 0 {
                    self.done = true;
                    self.input_same = false;
                } else {
                    self.input_same = true;
                }
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
}

/// Streaming Zstandard decompression.
pub struct ZstDecompressFilter {
    decoder: Decoder<'static>,
    input_offset: usize,
    input_same: bool,
    done: bool,
}

impl ZstDecompressFilter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            decoder: Decoder::new()
                .map_err(|e| FilterError::Format(format!("unable to create zst decoder: {e}")))?,
            input_offset: 0,
            input_same: false,
            done: false,
        })
    }
}

impl Filter for ZstDecompressFilter {
    fn filter_type(&self) -> FilterType {
        ZST_DECOMPRESS_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        match input {
            Some(input) => {
                if self.done {
                    self.input_same = false;
                    self.input_offset = 0;
                    return Ok(());
                }

                let source = &input[self.input_offset..];
                let mut in_buffer = InBuffer::around(source);
                let mut frame_remaining = usize::MAX;

                output.extend_with(|out| {
                    let mut out_buffer = OutBuffer::around(out);
                    let status = self
                        .decoder
                        .run(&mut in_buffer, &mut out_buffer)
                        .map_err(|e| {
                            FilterError::Format(format!("unable to decompress zst data: {e}"))
                        })?;
                    frame_remaining = status;
                    Ok::<_, FilterError>(out_buffer.pos())
                })?;

                self.input_offset += in_buffer.pos;

                if frame_remaining == 0 {
                    self.done = true;
                    self.input_same = false;
                    self.input_offset = 0;
                } else if output.is_full() {
                    self.input_same = true;
                } else if self.input_offset == input.len() {
                    self.input_offset = 0;
                    self.input_same = false;
                } else {
                    self.input_same = true;
                }
            }
            None => {
                if !self.done {
                    return Err(FilterError::Format(
                        "unexpected eof in compressed data".to_string(),
                    ));
                }
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
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn truncated_stream_fails_flush() {
        let mut compress = ZstCompressFilter::new(3).unwrap();
        let mut compressed = Buffer::new(1024 * 1024);
        compress
            .process_in_out(Some(b"zstd data to compress"), &mut compressed)
            .unwrap();
        compress.process_in_out(None, &mut compressed).unwrap();

        let truncated = &compressed.as_slice()[..compressed.used() - 5];

        let mut decompress = ZstDecompressFilter::new().unwrap();
        let mut output = Buffer::new(1024 * 1024);
        decompress
            .process_in_out(Some(truncated), &mut output)
            .unwrap();

        assert!(matches!(
            decompress.process_in_out(None, &mut output),
            Err(FilterError::Format(_))
        ));
    }
}
