//! Passphrase to key derivation
//!
//! Reimplements OpenSSL's `EVP_BytesToKey` with a SHA-1 digest and a single
//! round, which is what the `openssl enc -aes-256-cbc` command line uses for
//! salted files. Keeping this derivation means repository files decrypt with
//! stock tooling when an operator needs to inspect one by hand.

use digest::Digest;
use sha1::Sha1;
use zeroize::Zeroizing;

/// AES-256 key length in bytes
pub const KEY_SIZE: usize = 32;

/// AES block / CBC IV length in bytes
pub const IV_SIZE: usize = 16;

/// Derive an AES-256 key and CBC initialization vector from a passphrase
/// and an 8-byte salt.
///
/// The digest is iterated `D_i = H(D_{i-1} || pass || salt)` and the
/// concatenated output is split into key then IV.
pub fn bytes_to_key(pass: &[u8], salt: &[u8]) -> (Zeroizing<[u8; KEY_SIZE]>, [u8; IV_SIZE]) {
    let mut derived = Zeroizing::new(Vec::with_capacity(KEY_SIZE + IV_SIZE + 20));
    let mut block: Option<Vec<u8>> = None;

    while derived.len() < KEY_SIZE + IV_SIZE {
        let mut digest = Sha1::new();

        if let Some(prior) = &block {
            digest.update(prior);
        }

        digest.update(pass);
        digest.update(salt);

        let next = digest.finalize().to_vec();
        derived.extend_from_slice(&next);
        block = Some(next);
    }

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    let mut iv = [0u8; IV_SIZE];

    key.copy_from_slice(&derived[..KEY_SIZE]);
    iv.copy_from_slice(&derived[KEY_SIZE..KEY_SIZE + IV_SIZE]);

    (key, iv)
}
