//! bzip2 compression filters

use bzip2::{Action, Compress, Compression, Decompress, Status};
use stanza_pack::StringId;

use crate::buffer::Buffer;
use crate::error::{FilterError, Result};
use crate::{Filter, FilterType};

/// Filter type of [`Bz2CompressFilter`]
pub const BZ2_COMPRESS_FILTER_TYPE: FilterType = StringId::new("bz2-cmp");

/// Filter type of [`Bz2DecompressFilter`]
pub const BZ2_DECOMPRESS_FILTER_TYPE: FilterType = StringId::new("bz2-dcmp");

/// Streaming bzip2 compression.
pub struct Bz2CompressFilter {
    compress: Compress,
    input_offset: usize,
    input_same: bool,
    done: bool,
}

impl Bz2CompressFilter {
    pub fn new(level: i32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level.clamp(1, 9) as u32), 30),
            input_offset: 0,
            input_same: false,
            done: false,
        }
    }
}

impl Filter for Bz2CompressFilter {
    fn filter_type(&self) -> FilterType {
        BZ2_COMPRESS_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        match input {
            Some(input) => {
                let source = &input[self.input_offset..];
                let before_in = self.compress.total_in();

                output.extend_with(|out| {
                    let before_out = self.compress.total_out();
                    self.compress
                        .compress(source, out, Action::Run)
                        .map_err(|e| {
                            FilterError::Format(format!("unable to compress bz2 data: {e}"))
                        })?;
                    Ok::<_, FilterError>((self.compress.total_out() - before_out) as usize)
                })?;

                let consumed = (self.compress.total_in() - before_in) as usize;
                self.input_offset += consumed;

                if self.input_offset == input.len() {
                    self.input_offset = 0;
                    self.input_same = false;
                } else {
                    self.input_same = true;
                }
            }
            None => {
                let mut status = Status::Ok;

                output.extend_with(|out| {
                    let before_out = self.compress.total_out();
                    status = self
                        .compress
                        .compress(&[], out, Action::Finish)
                        .map_err(|e| {
                            FilterError::Format(format!("unable to compress bz2 data: {e}"))
                        })?;
                    Ok::<_, FilterError>((self.compress.total_out() - before_out) as usize)
                })?;

                if status == Status::StreamEnd {
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

/// Streaming bzip2 decompression.
pub struct Bz2DecompressFilter {
    decompress: Decompress,
    input_offset: usize,
    input_same: bool,
    done: bool,
}

impl Bz2DecompressFilter {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(false),
            input_offset: 0,
            input_same: false,
            done: false,
        }
    }
}

impl Default for Bz2DecompressFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Bz2DecompressFilter {
    fn filter_type(&self) -> FilterType {
        BZ2_DECOMPRESS_FILTER_TYPE
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
                let before_in = self.decompress.total_in();
                let mut status = Status::Ok;

                output.extend_with(|out| {
                    let before_out = self.decompress.total_out();
                    status = self.decompress.decompress(source, out).map_err(|e| {
                        FilterError::Format(format!("unable to decompress bz2 data: {e}"))
                    })?;
                    Ok::<_, FilterError>((self.decompress.total_out() - before_out) as usize)
                })?;

                let consumed = (self.decompress.total_in() - before_in) as usize;
                self.input_offset += consumed;

                if status == Status::StreamEnd {
                    self.done = true;
                    self.input_same = false;
                    self.input_offset = 0;
                } else if output.is_full() {
                    // More output may be pending even when the input has
                    // been consumed; keep the stream alive until drained
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
                    // The decompressor emits output as it goes; reaching
                    // flush before the stream end means truncated input
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
        let mut compress = Bz2CompressFilter::new(3);
        let mut compressed = Buffer::new(1024 * 1024);
        compress
            .process_in_out(Some(b"bz2 data to compress"), &mut compressed)
            .unwrap();
        compress.process_in_out(None, &mut compressed).unwrap();

        let truncated = &compressed.as_slice()[..compressed.used() - 5];

        let mut decompress = Bz2DecompressFilter::new();
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
