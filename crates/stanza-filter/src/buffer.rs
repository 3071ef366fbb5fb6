//! Fixed-capacity byte buffer and the identity buffer filter

use stanza_pack::StringId;

use crate::error::Result;
use crate::{Filter, FilterType};

/// Filter type of [`BufferFilter`]
pub const BUFFER_FILTER_TYPE: FilterType = StringId::new("buffer");

/// A byte buffer with a fixed capacity and a used region.
///
/// Filters append to the used region; the capacity never grows. A full
/// buffer is the signal that drives the `input_same` backpressure protocol.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    capacity: usize,
}

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes in the used region.
    pub fn used(&self) -> usize {
        self.data.len()
    }

    /// Bytes that may still be appended.
    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() == self.capacity
    }

    /// Reset the used region to empty. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append as much of `src` as fits, returning the number of bytes
    /// copied.
    pub fn extend_limited(&mut self, src: &[u8]) -> usize {
        let copy = src.len().min(self.remaining());
        self.data.extend_from_slice(&src[..copy]);
        copy
    }

    /// Expose the unused region to a producer that writes into a mutable
    /// slice (compression backends), extending the used region by the
    /// number of bytes the closure reports written.
    pub fn extend_with<E>(
        &mut self,
        f: impl FnOnce(&mut [u8]) -> std::result::Result<usize, E>,
    ) -> std::result::Result<usize, E> {
        let used = self.data.len();
        self.data.resize(self.capacity, 0);

        match f(&mut self.data[used..]) {
            Ok(produced) => {
                self.data.truncate(used + produced);
                Ok(produced)
            }
            Err(err) => {
                self.data.truncate(used);
                Err(err)
            }
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Identity filter that copies input to output.
///
/// Appended automatically by the group when the terminal filter is
/// sink-only, so every group can be used as a producer.
#[derive(Debug, Default)]
pub struct BufferFilter {
    /// Offset into the re-presented input that has already been copied
    input_offset: usize,
    input_same: bool,
    done: bool,
}

impl BufferFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Filter for BufferFilter {
    fn filter_type(&self) -> FilterType {
        BUFFER_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        match input {
            None => {
                self.done = true;
                self.input_same = false;
            }
            Some(input) => {
                let copied = output.extend_limited(&input[self.input_offset..]);

                if self.input_offset + copied == input.len() {
                    self.input_offset = 0;
                    self.input_same = false;
                } else {
                    self.input_offset += copied;
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
