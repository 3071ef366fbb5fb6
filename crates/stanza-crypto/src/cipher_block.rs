//! Salted block cipher
//!
//! Encrypts and decrypts byte streams with AES-256-CBC in the salted format
//! used by the `openssl enc` command line tool: the stream begins with the
//! 8-byte magic `Salted__` followed by an 8-byte random salt, and key plus
//! IV are derived from passphrase and salt (see [`crate::kdf`]).
//!
//! The object is a push-style state machine. On encrypt the header is
//! generated before the first output; on decrypt the header is accumulated
//! across arbitrarily small feeds before any plaintext is produced. Flushing
//! before a complete header has been seen is an error.

use aes::Aes256;
use cbc::{Decryptor, Encryptor};
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};
use crate::kdf;

/// Magic prefix for salted streams, shared with the openssl tool
pub const CIPHER_MAGIC: &[u8; 8] = b"Salted__";

/// Salt length in bytes
pub const SALT_SIZE: usize = 8;

/// Total header length (magic plus salt)
pub const CIPHER_HEADER_SIZE: usize = CIPHER_MAGIC.len() + SALT_SIZE;

/// AES block size in bytes
const BLOCK_SIZE: usize = 16;

/// Cipher direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

enum Context {
    /// Header not yet generated/consumed
    Pending,
    Encrypt(Encryptor<Aes256>),
    Decrypt(Decryptor<Aes256>),
    /// Consumed by flush
    Spent,
}

/// Streaming AES-256-CBC encrypt/decrypt state.
pub struct CipherBlock {
    mode: CipherMode,
    pass: Zeroizing<Vec<u8>>,
    context: Context,
    /// Partial decrypt header accumulated so far
    header: [u8; CIPHER_HEADER_SIZE],
    header_size: usize,
    /// Bytes waiting for a complete cipher block. Plaintext on encrypt,
    /// ciphertext on decrypt.
    partial: Zeroizing<Vec<u8>>,
}

impl CipherBlock {
    pub fn new(mode: CipherMode, pass: &[u8]) -> Self {
        Self {
            mode,
            pass: Zeroizing::new(pass.to_vec()),
            context: Context::Pending,
            header: [0; CIPHER_HEADER_SIZE],
            header_size: 0,
            partial: Zeroizing::new(Vec::new()),
        }
    }

    /// True once the salt has been generated (encrypt) or read (decrypt).
    pub fn salt_done(&self) -> bool {
        !matches!(self.context, Context::Pending)
    }

    /// Process a chunk of the stream, appending output to `destination`.
    ///
    /// Output may be empty while the decrypt header is accumulating or while
    /// input is buffered up to the next cipher block boundary.
    pub fn process(&mut self, mut source: &[u8], destination: &mut Vec<u8>) -> Result<()> {
        if let Context::Pending = self.context {
            match self.mode {
                CipherMode::Encrypt => {
                    // Magic first so the openssl tool recognizes the stream
                    destination.extend_from_slice(CIPHER_MAGIC);

                    let salt: [u8; SALT_SIZE] = rand::random();
                    destination.extend_from_slice(&salt);

                    let (key, iv) = kdf::bytes_to_key(&self.pass, &salt);
                    self.context =
                        Context::Encrypt(Encryptor::new((&*key).into(), (&iv).into()));
                }
                CipherMode::Decrypt => {
                    // Accumulate the header, possibly across many feeds
                    let need = CIPHER_HEADER_SIZE - self.header_size;
                    let take = need.min(source.len());

                    self.header[self.header_size..self.header_size + take]
                        .copy_from_slice(&source[..take]);
                    self.header_size += take;
                    source = &source[take..];

                    if self.header_size < CIPHER_HEADER_SIZE {
                        return Ok(());
                    }

                    if &self.header[..CIPHER_MAGIC.len()] != CIPHER_MAGIC {
                        return Err(CryptoError::HeaderInvalid);
                    }

                    let (key, iv) =
                        kdf::bytes_to_key(&self.pass, &self.header[CIPHER_MAGIC.len()..]);
                    self.context =
                        Context::Decrypt(Decryptor::new((&*key).into(), (&iv).into()));
                }
            }
        }

        if source.is_empty() {
            return Ok(());
        }

        self.partial.extend_from_slice(source);

        match &mut self.context {
            Context::Encrypt(encryptor) => {
                // Encrypt every complete block; the remainder waits
                let process_size = (self.partial.len() / BLOCK_SIZE) * BLOCK_SIZE;

                for block in self.partial[..process_size].chunks_exact_mut(BLOCK_SIZE) {
                    encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
                    destination.extend_from_slice(block);
                }

                self.partial.drain(..process_size);
            }
            Context::Decrypt(decryptor) => {
                // Hold back the trailing block: it may carry the padding and
                // must be processed by flush
                let len = self.partial.len();
                let process_size = len.saturating_sub(1) / BLOCK_SIZE * BLOCK_SIZE;

                for block in self.partial[..process_size].chunks_exact_mut(BLOCK_SIZE) {
                    decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
                    destination.extend_from_slice(block);
                }

                self.partial.drain(..process_size);
            }
            _ => {}
        }

        Ok(())
    }

    /// Finish the stream, appending the final block(s) to `destination`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::HeaderMissing`] when no header was ever generated or
    /// read; [`CryptoError::FlushFailed`] when the final block is truncated
    /// or its padding does not verify (wrong key or corrupt data).
    pub fn flush(mut self, destination: &mut Vec<u8>) -> Result<()> {
        match std::mem::replace(&mut self.context, Context::Spent) {
            Context::Pending => Err(CryptoError::HeaderMissing),
            Context::Encrypt(encryptor) => {
                // Pad and encrypt the remainder; a full padding block is
                // produced even when the remainder is empty
                let message_size = self.partial.len();
                let mut buffer = Zeroizing::new(vec![0u8; message_size + BLOCK_SIZE]);
                buffer[..message_size].copy_from_slice(&self.partial);

                let encrypted = encryptor
                    .encrypt_padded_mut::<Pkcs7>(&mut buffer, message_size)
                    .map_err(|_| CryptoError::FlushFailed)?;

                destination.extend_from_slice(encrypted);
                Ok(())
            }
            Context::Decrypt(decryptor) => {
                if self.partial.is_empty() || self.partial.len() % BLOCK_SIZE != 0 {
                    return Err(CryptoError::FlushFailed);
                }

                let decrypted = decryptor
                    .decrypt_padded_mut::<Pkcs7>(&mut self.partial)
                    .map_err(|_| CryptoError::FlushFailed)?;

                destination.extend_from_slice(decrypted);
                Ok(())
            }
            Context::Spent => Err(CryptoError::FlushFailed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn encrypt_all(pass: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut encrypt = CipherBlock::new(CipherMode::Encrypt, pass);
        let mut out = Vec::new();
        encrypt.process(plaintext, &mut out).unwrap();
        encrypt.flush(&mut out).unwrap();
        out
    }

    fn decrypt_all(pass: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut decrypt = CipherBlock::new(CipherMode::Decrypt, pass);
        let mut out = Vec::new();
        decrypt.process(ciphertext, &mut out)?;
        decrypt.flush(&mut out)?;
        Ok(out)
    }

    #[test]
    fn round_trip() {
        let plaintext = b"a block cipher round trip that spans multiple aes blocks";
        let ciphertext = encrypt_all(b"secret", plaintext);

        assert_eq!(&ciphertext[..8], CIPHER_MAGIC);
        assert_eq!(decrypt_all(b"secret", &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn empty_plaintext_round_trip() {
        let ciphertext = encrypt_all(b"secret", b"");

        // Header plus one padding block
        assert_eq!(ciphertext.len(), CIPHER_HEADER_SIZE + 16);
        assert_eq!(decrypt_all(b"secret", &ciphertext).unwrap(), b"");
    }

    #[test]
    fn decrypt_one_byte_at_a_time() {
        let plaintext = b"fed through the decrypter one byte at a time";
        let ciphertext = encrypt_all(b"secret", plaintext);

        let mut decrypt = CipherBlock::new(CipherMode::Decrypt, b"secret");
        let mut out = Vec::new();

        for byte in &ciphertext {
            decrypt.process(std::slice::from_ref(byte), &mut out).unwrap();
        }

        decrypt.flush(&mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn wrong_pass_fails_flush() {
        let ciphertext = encrypt_all(b"secret", b"some plaintext");
        assert!(matches!(
            decrypt_all(b"wrong", &ciphertext),
            Err(CryptoError::FlushFailed)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut decrypt = CipherBlock::new(CipherMode::Decrypt, b"secret");
        let mut out = Vec::new();

        let err = decrypt
            .process(b"NotSalted_______", &mut out)
            .unwrap_err();
        assert!(matches!(err, CryptoError::HeaderInvalid));
    }

    #[test]
    fn flush_without_header_errors() {
        let decrypt = CipherBlock::new(CipherMode::Decrypt, b"secret");
        let mut out = Vec::new();

        assert!(matches!(
            decrypt.flush(&mut out),
            Err(CryptoError::HeaderMissing)
        ));
    }

    #[test]
    fn truncated_ciphertext_fails_flush() {
        let mut ciphertext = encrypt_all(b"secret", b"0123456789abcdef0123456789abcdef");
        ciphertext.truncate(ciphertext.len() - 3);

        assert!(matches!(
            decrypt_all(b"secret", &ciphertext),
            Err(CryptoError::FlushFailed)
        ));
    }

    #[test]
    fn salts_differ_between_streams() {
        let first = encrypt_all(b"secret", b"same plaintext");
        let second = encrypt_all(b"secret", b"same plaintext");

        assert_ne!(first, second);
    }
}
