//! Driving filter groups over readers and writers
//!
//! [`copy`] and [`drain`] push a reader through a group from the outside;
//! [`FilteredReader`] turns a group into a pull-style [`Read`] for callers
//! that consume a transformed stream incrementally.

use std::io::{self, Read, Write};

use crate::buffer::Buffer;
use crate::error::Result;
use crate::group::FilterGroup;
use crate::BUFFER_SIZE_DEFAULT;

/// Stream `reader` through `group` into `writer`.
///
/// Opens and closes the group; results are available from the group
/// afterwards. Returns the number of bytes written.
pub fn copy(reader: &mut dyn Read, writer: &mut dyn Write, group: &mut FilterGroup) -> Result<u64> {
    group.open()?;

    let mut raw = vec![0u8; BUFFER_SIZE_DEFAULT];
    let mut output = Buffer::new(BUFFER_SIZE_DEFAULT);
    let mut written = 0u64;
    let mut eof = false;

    while !eof {
        let raw_used = reader.read(&mut raw)?;

        if raw_used == 0 {
            eof = true;
        }

        let input = if eof { None } else { Some(&raw[..raw_used]) };

        loop {
            group.process(input, &mut output)?;
            writer.write_all(output.as_slice())?;
            written += output.used() as u64;
            output.clear();

            if !group.input_same() {
                break;
            }
        }
    }

    while !group.done() {
        group.process(None, &mut output)?;
        writer.write_all(output.as_slice())?;
        written += output.used() as u64;
        output.clear();
    }

    group.close()?;
    Ok(written)
}

/// Stream `reader` through `group`, discarding output.
///
/// Used when only the filter results matter, e.g. checksumming a file
/// without copying it anywhere.
pub fn drain(reader: &mut dyn Read, group: &mut FilterGroup) -> Result<()> {
    copy(reader, &mut io::sink(), group)?;
    Ok(())
}

/// Pull-style adapter: reading from this object reads the inner stream
/// through the group.
///
/// The group must not be opened beforehand; it is opened here and can be
/// recovered with [`FilteredReader::into_group`] for result collection.
pub struct FilteredReader<R: Read> {
    inner: R,
    group: FilterGroup,
    raw: Vec<u8>,
    raw_used: usize,
    raw_spent: bool,
    eof: bool,
    out: Buffer,
    out_pos: usize,
}

impl<R: Read> FilteredReader<R> {
    pub fn new(inner: R, mut group: FilterGroup) -> Result<Self> {
        group.open()?;

        Ok(Self {
            inner,
            group,
            raw: vec![0u8; BUFFER_SIZE_DEFAULT],
            raw_used: 0,
            raw_spent: true,
            eof: false,
            out: Buffer::new(BUFFER_SIZE_DEFAULT),
            out_pos: 0,
        })
    }

    /// Recover the group, e.g. to close it and read filter results, along
    /// with the inner reader.
    pub fn into_parts(self) -> (R, FilterGroup) {
        (self.inner, self.group)
    }
}

impl<R: Read> Read for FilteredReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // Serve buffered output first
            if self.out_pos < self.out.used() {
                let available = &self.out.as_slice()[self.out_pos..];
                let copy = available.len().min(buf.len());
                buf[..copy].copy_from_slice(&available[..copy]);
                self.out_pos += copy;
                return Ok(copy);
            }

            if self.group.done() {
                return Ok(0);
            }

            self.out.clear();
            self.out_pos = 0;

            // Refill the raw buffer when the group consumed the last fill
            if !self.group.input_same() && !self.eof && self.raw_spent {
                self.raw_used = self.inner.read(&mut self.raw)?;

                if self.raw_used == 0 {
                    self.eof = true;
                }

                self.raw_spent = false;
            }

            let input = if self.eof {
                None
            } else {
                Some(&self.raw[..self.raw_used])
            };

            self.group
                .process(input, &mut self.out)
                .map_err(io::Error::other)?;

            if !self.group.input_same() {
                self.raw_spent = true;
            }
        }
    }
}
