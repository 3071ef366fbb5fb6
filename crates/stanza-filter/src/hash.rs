//! Cryptographic hash filter

use stanza_crypto::{HashContext, HashType};
use stanza_pack::{Pack, PackWrite, StringId};

use crate::error::{FilterError, Result};
use crate::{Filter, FilterType};

/// Filter type of [`HashFilter`]
pub const HASH_FILTER_TYPE: FilterType = StringId::new("hash");

/// Digests the bytes that pass this point in the pipeline.
///
/// Sink-only; the result pack carries the final digest as binary.
pub struct HashFilter {
    context: Option<HashContext>,
    digest: Option<Vec<u8>>,
}

impl HashFilter {
    pub fn new(hash_type: HashType) -> Self {
        Self {
            context: Some(HashContext::new(hash_type)),
            digest: None,
        }
    }

    /// The digest, available once the result has been collected.
    pub fn digest(&self) -> Option<&[u8]> {
        self.digest.as_deref()
    }
}

impl Filter for HashFilter {
    fn filter_type(&self) -> FilterType {
        HASH_FILTER_TYPE
    }

    fn output(&self) -> bool {
        false
    }

    fn process_in(&mut self, input: &[u8]) -> Result<()> {
        match &mut self.context {
            Some(context) => {
                context.update(input);
                Ok(())
            }
            None => Err(FilterError::Assert(
                "hash filter used after result".to_string(),
            )),
        }
    }

    fn result(&mut self) -> Result<Option<Pack>> {
        let context = self.context.take().ok_or_else(|| {
            FilterError::Assert("hash filter result requested twice".to_string())
        })?;

        let digest = context.finish();
        self.digest = Some(digest.clone());

        let mut pack = PackWrite::new();
        pack.write_bin(&digest)?;
        Ok(Some(pack.end()?))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use stanza_pack::PackRead;

    #[test]
    fn digest_matches_one_shot() {
        let mut filter = HashFilter::new(HashType::Sha1);
        filter.process_in(b"abc").unwrap();

        let result = filter.result().unwrap().unwrap();
        let mut read = PackRead::new(&result);
        assert_eq!(
            hex::encode(read.read_bin().unwrap()),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn result_is_single_use() {
        let mut filter = HashFilter::new(HashType::Sha1);
        filter.result().unwrap();
        assert!(filter.result().is_err());
    }
}
