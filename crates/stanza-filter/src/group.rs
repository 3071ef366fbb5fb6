//! Filter group
//!
//! Composes a sequence of filters into one virtual stream. The group owns
//! the filters, the intermediate buffers between adjacent stages, flush
//! propagation when input ends, and per-filter result collection on close.

use tracing::trace;

use stanza_pack::Pack;

use crate::buffer::{Buffer, BufferFilter};
use crate::error::{FilterError, Result};
use crate::{BUFFER_SIZE_DEFAULT, Filter, FilterType};

/// Where a filter reads its input from.
#[derive(Debug, Clone, Copy)]
enum InputSource {
    /// The caller-supplied group input
    Group,
    /// An intermediate buffer owned by the group
    Buffer(usize),
}

/// Where a filter writes its output to.
#[derive(Debug, Clone, Copy)]
enum OutputDest {
    /// Sink-only filter, no output
    None,
    /// An intermediate buffer owned by the group
    Buffer(usize),
    /// The caller-supplied group output (terminal filter)
    Group,
}

struct FilterData {
    filter: Box<dyn Filter>,
    input: InputSource,
    output: OutputDest,
}

/// Ordered composition of filters with one stream-in, stream-out interface.
///
/// Lifecycle: [`FilterGroup::add`] filters, [`FilterGroup::open`], repeated
/// [`FilterGroup::process`] calls (ending with `None` input to flush), then
/// [`FilterGroup::close`] to collect results.
pub struct FilterGroup {
    data: Vec<FilterData>,
    buffers: Vec<Buffer>,
    /// Index of the first filter that produces output
    first_output: usize,
    results: Vec<(FilterType, Option<Pack>)>,
    input_same: bool,
    done: bool,
    opened: bool,
    flushing: bool,
    closed: bool,
}

impl Default for FilterGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterGroup {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            buffers: Vec::new(),
            first_output: 0,
            results: Vec::new(),
            input_same: false,
            done: true,
            opened: false,
            flushing: false,
            closed: false,
        }
    }

    /// Add a filter to the end of the group. Only valid before open.
    pub fn add(&mut self, filter: Box<dyn Filter>) -> &mut Self {
        debug_assert!(!self.opened && !self.closed);

        self.data.push(FilterData {
            filter,
            input: InputSource::Group,
            output: OutputDest::None,
        });
        self
    }

    /// Number of filters, including any implicitly added buffer filter.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wire buffers between stages and allocate intermediates.
    ///
    /// If the terminal filter does not produce output an identity buffer
    /// filter is appended so the group can be used as a producer.
    pub fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(FilterError::Assert(
                "filter group already opened".to_string(),
            ));
        }

        if self.data.is_empty() || !self.data[self.data.len() - 1].filter.output() {
            self.add(Box::new(BufferFilter::new()));
        }

        // Filters up to the first output filter read the group input; after
        // that each filter reads the most recent intermediate buffer
        let mut last_buffer: Option<usize> = None;
        let mut first_output_seen = false;
        let filter_count = self.data.len();

        for (idx, data) in self.data.iter_mut().enumerate() {
            data.input = match last_buffer {
                None => InputSource::Group,
                Some(buffer_idx) => InputSource::Buffer(buffer_idx),
            };

            if data.filter.output() {
                if !first_output_seen {
                    self.first_output = idx;
                    first_output_seen = true;
                }

                if idx < filter_count - 1 {
                    self.buffers.push(Buffer::new(BUFFER_SIZE_DEFAULT));
                    let buffer_idx = self.buffers.len() - 1;
                    data.output = OutputDest::Buffer(buffer_idx);
                    last_buffer = Some(buffer_idx);
                } else {
                    data.output = OutputDest::Group;
                }
            }
        }

        self.opened = true;
        Ok(())
    }

    /// Run one processing step.
    ///
    /// `input == None` starts the flush; once flushing has begun input must
    /// stay `None`. When [`FilterGroup::input_same`] is true after the call
    /// the caller must drain `output` and call again with the same input.
    pub fn process(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        if !self.opened || self.closed {
            return Err(FilterError::Assert(
                "filter group process before open or after close".to_string(),
            ));
        }

        if self.flushing && input.is_some() {
            return Err(FilterError::Assert(
                "filter group input after flush started".to_string(),
            ));
        }

        if output.remaining() == 0 {
            return Err(FilterError::Assert(
                "filter group output buffer is full".to_string(),
            ));
        }

        if input.is_none() {
            self.flushing = true;
        }

        loop {
            // Start from the first filter by default. When a filter needed
            // the same input, restart from the right-most such filter: its
            // output was full and has now been drained.
            let mut start_idx = 0;

            if self.input_same {
                self.input_same = false;
                let mut idx = self.data.len();

                loop {
                    idx -= 1;

                    if self.data[idx].filter.input_same() {
                        self.input_same = true;
                        start_idx = idx;
                        break;
                    }

                    if idx == self.first_output {
                        break;
                    }
                }

                // No filter needs the same input, so the current input is
                // consumed and the caller must supply more
                if !self.input_same {
                    break;
                }
            }

            for idx in start_idx..self.data.len() {
                self.process_one(idx, input, output)?;
            }

            if output.is_full() || !self.input_same {
                break;
            }
        }

        // Recompute group state by scanning all filters; a filter that
        // still wants the same input means the group is not done
        self.done = true;
        self.input_same = false;

        for data in &self.data {
            if data.filter.input_same() {
                self.done = false;
                self.input_same = true;
                break;
            }

            if !data.filter.done() {
                self.done = false;
            }
        }

        Ok(())
    }

    /// Drive a single filter, resolving its input and output buffers.
    fn process_one(
        &mut self,
        idx: usize,
        group_input: Option<&[u8]>,
        group_output: &mut Buffer,
    ) -> Result<()> {
        let produces_output = self.data[idx].filter.output();

        if produces_output {
            let filter_done = self.data[idx].filter.done();

            // Substitute flush input when the group is flushing, this
            // filter's upstream is done and its input buffer has drained
            let input_is_none = match self.data[idx].input {
                InputSource::Group => group_input.is_none(),
                InputSource::Buffer(buffer_idx) => {
                    group_input.is_none()
                        && !filter_done
                        && idx > 0
                        && self.data[idx - 1].filter.done()
                        && self.buffers[buffer_idx].is_empty()
                }
            };

            // Keep processing while the filter is not done or has input
            if !filter_done || !input_is_none {
                let input_buffer_idx = match self.data[idx].input {
                    InputSource::Buffer(buffer_idx) if !input_is_none => Some(buffer_idx),
                    _ => None,
                };

                let data = &mut self.data[idx];

                match data.output {
                    OutputDest::Group => {
                        let input = if input_is_none {
                            None
                        } else {
                            match data.input {
                                InputSource::Group => group_input,
                                InputSource::Buffer(buffer_idx) => {
                                    Some(self.buffers[buffer_idx].as_slice())
                                }
                            }
                        };

                        data.filter.process_in_out(input, group_output)?;
                    }
                    OutputDest::Buffer(out_idx) => {
                        match data.input {
                            InputSource::Group => {
                                let input = if input_is_none { None } else { group_input };
                                data.filter
                                    .process_in_out(input, &mut self.buffers[out_idx])?;
                            }
                            InputSource::Buffer(in_idx) => {
                                // in_idx < out_idx always holds: buffers are
                                // allocated in pipeline order
                                let (left, right) = self.buffers.split_at_mut(out_idx);
                                let input = if input_is_none {
                                    None
                                } else {
                                    Some(left[in_idx].as_slice())
                                };

                                data.filter.process_in_out(input, &mut right[0])?;
                            }
                        }
                    }
                    OutputDest::None => unreachable!("output filter without destination"),
                }

                if self.data[idx].filter.input_same() {
                    self.input_same = true;
                } else if let Some(buffer_idx) = input_buffer_idx {
                    // Input consumed; clear the local buffer. Caller-owned
                    // input is cleared by the caller.
                    self.buffers[buffer_idx].clear();
                }
            }
        } else {
            // Sink-only filter: no flush needed, nothing is buffered
            let data = &self.data[idx];
            let input = match data.input {
                InputSource::Group => group_input,
                InputSource::Buffer(buffer_idx) => {
                    let buffer = &self.buffers[buffer_idx];
                    if buffer.is_empty() && group_input.is_none() {
                        None
                    } else {
                        Some(buffer.as_slice())
                    }
                }
            };

            if let Some(input) = input {
                self.data[idx].filter.process_in(input)?;
            }
        }

        Ok(())
    }

    /// True when no filter will produce more output.
    pub fn done(&self) -> bool {
        self.done
    }

    /// True when the caller must re-present the same input.
    pub fn input_same(&self) -> bool {
        self.input_same
    }

    /// Collect results from every filter, indexed by filter type and
    /// position.
    pub fn close(&mut self) -> Result<()> {
        if !self.opened || self.closed {
            return Err(FilterError::Assert(
                "filter group close before open or after close".to_string(),
            ));
        }

        for data in &mut self.data {
            let result = data.filter.result()?;
            trace!(filter = %data.filter.filter_type(), has_result = result.is_some(), "filter result");
            self.results.push((data.filter.filter_type(), result));
        }

        self.closed = true;
        Ok(())
    }

    /// Result of the first filter of `filter_type`. Only valid after close.
    pub fn result(&self, filter_type: FilterType) -> Option<&Pack> {
        self.result_at(filter_type, 0)
    }

    /// Result of the `idx`-th filter of `filter_type`, for groups that
    /// contain the same filter more than once.
    pub fn result_at(&self, filter_type: FilterType, idx: usize) -> Option<&Pack> {
        self.results
            .iter()
            .filter(|(ty, _)| *ty == filter_type)
            .nth(idx)
            .and_then(|(_, pack)| pack.as_ref())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hash::{HASH_FILTER_TYPE, HashFilter};
    use crate::size::{SIZE_FILTER_TYPE, SizeFilter};
    use stanza_crypto::HashType;
    use stanza_pack::PackRead;

    fn drain_group(group: &mut FilterGroup, input: &[u8]) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut output = Buffer::new(7); // deliberately small

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

    #[test]
    fn sink_terminal_gets_implicit_buffer_filter() {
        let mut group = FilterGroup::new();
        group.add(Box::new(SizeFilter::new()));
        group.open().unwrap();

        // size + implicit buffer
        assert_eq!(group.len(), 2);

        let out = drain_group(&mut group, b"pass through bytes");
        assert_eq!(out, b"pass through bytes");

        group.close().unwrap();
        let mut read = PackRead::new(group.result(SIZE_FILTER_TYPE).unwrap());
        assert_eq!(read.read_u64().unwrap(), 18);
    }

    #[test]
    fn multiple_sinks_share_the_stream() {
        let mut group = FilterGroup::new();
        group.add(Box::new(HashFilter::new(HashType::Sha1)));
        group.add(Box::new(SizeFilter::new()));
        group.open().unwrap();

        let out = drain_group(&mut group, b"abc");
        assert_eq!(out, b"abc");

        group.close().unwrap();

        let mut hash = PackRead::new(group.result(HASH_FILTER_TYPE).unwrap());
        assert_eq!(
            hex::encode(hash.read_bin().unwrap()),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );

        let mut size = PackRead::new(group.result(SIZE_FILTER_TYPE).unwrap());
        assert_eq!(size.read_u64().unwrap(), 3);
    }

    #[test]
    fn empty_input_then_flush_is_idempotent() {
        let mut group = FilterGroup::new();
        group.add(Box::new(SizeFilter::new()));
        group.open().unwrap();

        let mut output = Buffer::new(16);
        group.process(Some(b""), &mut output).unwrap();
        assert!(output.is_empty());

        group.process(None, &mut output).unwrap();
        assert!(output.is_empty());
        assert!(group.done());
    }

    #[test]
    fn positional_results_for_duplicate_types() {
        let mut group = FilterGroup::new();
        group.add(Box::new(SizeFilter::new()));
        group.add(Box::new(SizeFilter::new()));
        group.open().unwrap();

        drain_group(&mut group, b"12345");
        group.close().unwrap();

        let mut first = PackRead::new(group.result_at(SIZE_FILTER_TYPE, 0).unwrap());
        let mut second = PackRead::new(group.result_at(SIZE_FILTER_TYPE, 1).unwrap());
        assert_eq!(first.read_u64().unwrap(), 5);
        assert_eq!(second.read_u64().unwrap(), 5);
    }

    #[test]
    fn input_after_flush_is_rejected() {
        let mut group = FilterGroup::new();
        group.add(Box::new(SizeFilter::new()));
        group.open().unwrap();

        let mut output = Buffer::new(16);
        group.process(None, &mut output).unwrap();

        assert!(matches!(
            group.process(Some(b"late"), &mut output),
            Err(FilterError::Assert(_))
        ));
    }
}
