//! Streaming filter pipeline.
//!
//! Every byte that moves between a PostgreSQL cluster and a repository
//! passes through a [`FilterGroup`]: an ordered composition of filters that
//! presents one stream-in, stream-out interface. Concrete filters count
//! bytes, hash them, compress, decompress, encrypt and decrypt; the group
//! owns buffer routing, flush propagation and result collection.
//!
//! The filter contract is uniform and single-threaded:
//!
//! - `process_in_out(Some(input), output)` consumes input and may produce
//!   output. `process_in_out(None, output)` means no more input will
//!   arrive; flush.
//! - [`Filter::input_same`] after a call means the output buffer filled
//!   before the input was consumed; the caller must drain the output and
//!   call again with the *same* input.
//! - [`Filter::done`] means no more output will be produced regardless of
//!   further input.
//!
//! Sink-only filters (size, hash) implement `process_in` instead and never
//! produce output; the group appends an identity [`buffer::BufferFilter`]
//! when the terminal filter is a sink so the group remains a producer.

pub mod buffer;
pub mod chunked;
pub mod cipher;
pub mod compress;
pub mod error;
pub mod group;
pub mod hash;
pub mod io;
pub mod size;

pub use buffer::{Buffer, BufferFilter};
pub use chunked::{ChunkedReader, ChunkedWriter};
pub use cipher::CipherFilter;
pub use compress::{CompressType, compress_filter, decompress_filter};
pub use error::{FilterError, Result};
pub use group::FilterGroup;
pub use hash::HashFilter;
pub use io::{FilteredReader, copy, drain};
pub use size::SizeFilter;

use stanza_pack::{Pack, StringId};

/// Filters are identified by string id, both for result lookup and for
/// remote reconstruction over the protocol.
pub type FilterType = StringId;

/// Default capacity for intermediate buffers between filter stages.
pub const BUFFER_SIZE_DEFAULT: usize = 64 * 1024;

/// The uniform stream-processing contract.
///
/// Exactly one of [`Filter::process_in`] (sink-only filters) and
/// [`Filter::process_in_out`] (transforming filters) is implemented;
/// [`Filter::output`] declares which.
pub trait Filter {
    /// Type id used for result lookup and parameter transport.
    fn filter_type(&self) -> FilterType;

    /// True when the filter produces output. Sink-only filters return
    /// false and are driven through [`Filter::process_in`].
    fn output(&self) -> bool {
        true
    }

    /// Consume input without producing output. Only sink filters implement
    /// this.
    fn process_in(&mut self, _input: &[u8]) -> Result<()> {
        Err(FilterError::Assert(format!(
            "filter '{}' does not implement process_in",
            self.filter_type()
        )))
    }

    /// Consume input and/or produce output. `input == None` signals that no
    /// more input will arrive and buffered state must be flushed.
    fn process_in_out(&mut self, _input: Option<&[u8]>, _output: &mut Buffer) -> Result<()> {
        Err(FilterError::Assert(format!(
            "filter '{}' does not implement process_in_out",
            self.filter_type()
        )))
    }

    /// True when this filter will produce no more output regardless of
    /// further input; the group may short-circuit past it.
    fn done(&self) -> bool {
        !self.input_same()
    }

    /// True when the same input must be presented again because the output
    /// buffer filled before the input was consumed.
    fn input_same(&self) -> bool {
        false
    }

    /// Typed result produced after end-of-stream, e.g. the byte count of a
    /// size filter. Called once by [`FilterGroup::close`].
    fn result(&mut self) -> Result<Option<Pack>> {
        Ok(None)
    }

    /// Parameters sufficient to recreate this filter on another host.
    fn param(&self) -> Result<Option<Pack>> {
        Ok(None)
    }
}
