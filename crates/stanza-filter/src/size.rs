//! Byte counting filter

use stanza_pack::{PackWrite, StringId};

use crate::error::Result;
use crate::{Filter, FilterType};

/// Filter type of [`SizeFilter`]
pub const SIZE_FILTER_TYPE: FilterType = StringId::new("size");

/// Counts the bytes that pass this point in the pipeline.
///
/// Sink-only; the result pack carries the total as a u64.
#[derive(Debug, Default)]
pub struct SizeFilter {
    size: u64,
}

impl SizeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Filter for SizeFilter {
    fn filter_type(&self) -> FilterType {
        SIZE_FILTER_TYPE
    }

    fn output(&self) -> bool {
        false
    }

    fn process_in(&mut self, input: &[u8]) -> Result<()> {
        self.size += input.len() as u64;
        Ok(())
    }

    fn result(&mut self) -> Result<Option<stanza_pack::Pack>> {
        let mut pack = PackWrite::new();
        pack.write_u64_with(
            self.size,
            stanza_pack::WriteParam::new().default_write(),
        )?;

        Ok(Some(pack.end()?))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use stanza_pack::PackRead;

    #[test]
    fn counts_bytes_across_calls() {
        let mut filter = SizeFilter::new();
        filter.process_in(b"hello").unwrap();
        filter.process_in(b"").unwrap();
        filter.process_in(b" world").unwrap();

        assert_eq!(filter.size(), 11);

        let result = filter.result().unwrap().unwrap();
        let mut read = PackRead::new(&result);
        assert_eq!(read.read_u64().unwrap(), 11);
    }

    #[test]
    fn zero_bytes_is_a_valid_result() {
        let mut filter = SizeFilter::new();
        let result = filter.result().unwrap().unwrap();

        let mut read = PackRead::new(&result);
        assert_eq!(read.read_u64().unwrap(), 0);
    }
}
