//! gzip compression filters

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use stanza_pack::StringId;

use crate::buffer::Buffer;
use crate::error::{FilterError, Result};
use crate::{Filter, FilterType};

/// Filter type of [`GzCompressFilter`]
pub const GZ_COMPRESS_FILTER_TYPE: FilterType = StringId::new("gz-cmp");

/// Filter type of [`GzDecompressFilter`]
pub const GZ_DECOMPRESS_FILTER_TYPE: FilterType = StringId::new("gz-dcmp");

/// gzip window bits (maximum history)
const WINDOW_BITS: u8 = 15;

fn compression(level: i32) -> Compression {
    Compression::new(level.clamp(0, 9) as u32)
}

/// Streaming gzip compression.
pub struct GzCompressFilter {
    compress: Compress,
    /// Offset into re-presented input that has already been consumed
    input_offset: usize,
    input_same: bool,
    done: bool,
}

impl GzCompressFilter {
    pub fn new(level: i32) -> Self {
        Self {
            compress: Compress::new_gzip(compression(level), WINDOW_BITS),
            input_offset: 0,
            input_same: false,
            done: false,
        }
    }
}

impl Filter for GzCompressFilter {
    fn filter_type(&self) -> FilterType {
        GZ_COMPRESS_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        match input {
            Some(input) => {
                let source = &input[self.input_offset..];
                let before_in = self.compress.total_in();

                output.extend_with(|out| {
                    let before_out = self.compress.total_out();
                    self.compress
                        .compress(source, out, FlushCompress::None)
                        .map_err(|e| {
                            FilterError::Format(format!("unable to compress gz data: {e}"))
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
                        .compress(&[], out, FlushCompress::Finish)
                        .map_err(|e| {
                            FilterError::Format(format!("unable to compress gz data: {e}"))
                        })?;
                    Ok::<_, FilterError>((self.compress.total_out() - before_out) as usize)
                })?;

                if status == Status::StreamEnd {
                    self.done = true;
                    self.input_same = false;
                } else {
                    // More trailer bytes pending than the output could hold
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

/// Streaming gzip decompression.
pub struct GzDecompressFilter {
    decompress: Decompress,
    input_offset: usize,
    input_same: bool,
    done: bool,
}

impl GzDecompressFilter {
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new_gzip(WINDOW_BITS),
            input_offset: 0,
            input_same: false,
            done: false,
        }
    }
}

impl Default for GzDecompressFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for GzDecompressFilter {
    fn filter_type(&self) -> FilterType {
        GZ_DECOMPRESS_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        match input {
            Some(input) => {
                if self.done {
                    // Trailing bytes after the stream end are discarded
                    self.input_same = false;
                    self.input_offset = 0;
                    return Ok(());
                }

                let source = &input[self.input_offset..];
                let before_in = self.decompress.total_in();
                let mut status = Status::Ok;

                output.extend_with(|out| {
                    let before_out = self.decompress.total_out();
                    status = self
                        .decompress
                        .decompress(source, out, FlushDecompress::None)
                        .map_err(|e| {
                            FilterError::Format(format!("unable to decompress gz data: {e}"))
                        })?;
                    Ok::<_, FilterError>((self.decompress.total_out() - before_out) as usize)
                })?;

                let consumed = (self.decompress.total_in() - before_in) as usize;
                self.input_offset += consumed;

                if status == Status::StreamEnd {
                    self.done = true;
                    self.input_same = false;
                    self.input_offset = 0;
                } else if self.input_offset == input.len() {
                    self.input_offset = 0;
                    self.input_same = false;
                } else {
                    self.input_same = true;
                }
            }
            None => {
                if !self.done {
                    let mut status = Status::Ok;

                    output.extend_with(|out| {
                        let before_out = self.decompress.total_out();
                        status = self
                            .decompress
                            .decompress(&[], out, FlushDecompress::Finish)
                            .map_err(|e| {
                                FilterError::Format(format!("unable to decompress gz data: {e}"))
                            })?;
                        Ok::<_, FilterError>((self.decompress.total_out() - before_out) as usize)
                    })?;

                    if status == Status::StreamEnd {
                        self.done = true;
                        self.input_same = false;
                    } else if output.is_full() {
                        self.input_same = true;
                    } else {
                        return Err(FilterError::Format(
                            "unexpected eof in compressed data".to_string(),
                        ));
                    }
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
