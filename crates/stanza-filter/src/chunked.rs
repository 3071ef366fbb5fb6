//! Part framing for super-block bodies
//!
//! A part stream is a sequence of `<varint length> <bytes>` records ending
//! with a zero-length terminator. Every super-block body in a repository
//! file uses this framing, which lets a reader consume the body without
//! knowing its total size in advance.

use std::io::{self, Read};

use stanza_pack::varint;

/// Maximum part payload written by [`ChunkedWriter`].
///
/// Bounds the memory a reader must dedicate to one part while staying large
/// enough that framing overhead is noise.
pub const PART_SIZE_MAX: usize = 64 * 1024;

/// Reads a part stream, presenting the concatenated part payloads.
///
/// Returns end-of-stream at the zero-length terminator; the underlying
/// reader is left positioned immediately after it.
pub struct ChunkedReader<R: Read> {
    inner: R,
    part_remaining: u64,
    done: bool,
}

impl<R: Read> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            part_remaining: 0,
            done: false,
        }
    }

    /// Recover the underlying reader, e.g. to read the next super-block.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }

        while self.part_remaining == 0 {
            let length = varint::read_u64_io(&mut self.inner)?;

            if length == 0 {
                self.done = true;
                return Ok(0);
            }

            self.part_remaining = length;
        }

        let limit = buf.len().min(usize::try_from(self.part_remaining).unwrap_or(usize::MAX));
        let read = self.inner.read(&mut buf[..limit])?;

        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "part stream ended inside a part",
            ));
        }

        self.part_remaining -= read as u64;
        Ok(read)
    }
}

/// Frames bytes into a part stream appended to a byte vector.
pub struct ChunkedWriter<'a> {
    out: &'a mut Vec<u8>,
}

impl<'a> ChunkedWriter<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out }
    }

    /// Write `data` as one or more parts of at most [`PART_SIZE_MAX`].
    pub fn write(&mut self, data: &[u8]) {
        for part in data.chunks(PART_SIZE_MAX) {
            varint::write_u64(self.out, part.len() as u64);
            self.out.extend_from_slice(part);
        }
    }

    /// Write the zero-length terminator.
    pub fn finish(self) {
        varint::write_u64(self.out, 0);
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let mut framed = Vec::new();
        let mut writer = ChunkedWriter::new(&mut framed);
        writer.write(b"first part");
        writer.write(b"second");
        writer.finish();

        let mut reader = ChunkedReader::new(Cursor::new(&framed));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out, b"first partsecond");
    }

    #[test]
    fn empty_stream_is_just_a_terminator() {
        let mut framed = Vec::new();
        ChunkedWriter::new(&mut framed).finish();
        assert_eq!(framed, [0]);

        let mut reader = ChunkedReader::new(Cursor::new(&framed));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn large_payload_splits_into_parts() {
        let payload = vec![7u8; PART_SIZE_MAX * 2 + 100];

        let mut framed = Vec::new();
        let mut writer = ChunkedWriter::new(&mut framed);
        writer.write(&payload);
        writer.finish();

        let mut reader = ChunkedReader::new(Cursor::new(&framed));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn reader_stops_at_terminator() {
        let mut framed = Vec::new();
        let mut writer = ChunkedWriter::new(&mut framed);
        writer.write(b"part");
        writer.finish();
        framed.extend_from_slice(b"trailing bytes");

        let mut cursor = Cursor::new(&framed);
        let mut reader = ChunkedReader::new(&mut cursor);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"part");

        // Cursor sits right after the terminator
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"trailing bytes");
    }

    #[test]
    fn truncated_part_errors() {
        let mut framed = Vec::new();
        varint::write_u64(&mut framed, 100);
        framed.extend_from_slice(b"short");

        let mut reader = ChunkedReader::new(Cursor::new(&framed));
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
