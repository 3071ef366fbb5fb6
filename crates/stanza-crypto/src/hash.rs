//! Cryptographic hash contexts
//!
//! SHA-1 is the repository's content address (file checksums, block map
//! checksums); SHA-256 is available for callers that want a stronger digest.

use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;

/// Supported hash algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Sha1,
    Sha256,
}

impl HashType {
    /// Digest length in bytes
    pub const fn size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }
}

enum Inner {
    Sha1(Sha1),
    Sha256(Sha256),
}

/// An incremental hash over a byte stream.
pub struct HashContext {
    inner: Inner,
}

impl HashContext {
    pub fn new(hash_type: HashType) -> Self {
        let inner = match hash_type {
            HashType::Sha1 => Inner::Sha1(Sha1::new()),
            HashType::Sha256 => Inner::Sha256(Sha256::new()),
        };

        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Sha1(digest) => digest.update(data),
            Inner::Sha256(digest) => digest.update(data),
        }
    }

    /// Finish and return the digest bytes.
    pub fn finish(self) -> Vec<u8> {
        match self.inner {
            Inner::Sha1(digest) => digest.finalize().to_vec(),
            Inner::Sha256(digest) => digest.finalize().to_vec(),
        }
    }
}

/// Hash a complete message in one call.
pub fn hash_one(hash_type: HashType, data: &[u8]) -> Vec<u8> {
    let mut context = HashContext::new(hash_type);
    context.update(data);
    context.finish()
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sha1_known_vector() {
        // sha1("abc")
        assert_eq!(
            hex::encode(hash_one(HashType::Sha1, b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn sha1_empty_vector() {
        assert_eq!(
            hex::encode(hash_one(HashType::Sha1, b"")),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex::encode(hash_one(HashType::Sha256, b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut context = HashContext::new(HashType::Sha1);

        for chunk in b"the quick brown fox".chunks(3) {
            context.update(chunk);
        }

        assert_eq!(
            context.finish(),
            hash_one(HashType::Sha1, b"the quick brown fox")
        );
    }

    #[test]
    fn digest_sizes() {
        assert_eq!(HashType::Sha1.size(), 20);
        assert_eq!(HashType::Sha256.size(), 32);
    }
}
