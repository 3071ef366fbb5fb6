//! Block cipher filter
//!
//! Adapts [`stanza_crypto::CipherBlock`] to the filter contract. Encrypt
//! prepends the salted header before the first output; decrypt consumes the
//! same header, buffering until it is complete, so the filter behaves
//! identically whether the stream arrives in one buffer or one byte at a
//! time.

use stanza_crypto::{CipherBlock, CipherMode};
use stanza_pack::StringId;
use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::error::{FilterError, Result};
use crate::{Filter, FilterType};

/// Filter type of [`CipherFilter`]
pub const CIPHER_FILTER_TYPE: FilterType = StringId::new("cipher-blk");

/// Streaming encrypt/decrypt stage.
pub struct CipherFilter {
    cipher: Option<CipherBlock>,
    mode: CipherMode,
    /// Output produced but not yet drained into the group buffer
    pending: Zeroizing<Vec<u8>>,
    pending_offset: usize,
    input_same: bool,
    done: bool,
    flushed: bool,
}

impl CipherFilter {
    pub fn new(mode: CipherMode, pass: &[u8]) -> Self {
        Self {
            cipher: Some(CipherBlock::new(mode, pass)),
            mode,
            pending: Zeroizing::new(Vec::new()),
            pending_offset: 0,
            input_same: false,
            done: false,
            flushed: false,
        }
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Move pending output into the group buffer, setting `input_same` when
    /// it does not all fit.
    fn drain(&mut self, output: &mut Buffer) {
        let copied = output.extend_limited(&self.pending[self.pending_offset..]);
        self.pending_offset += copied;

        if self.pending_offset == self.pending.len() {
            self.pending.clear();
            self.pending_offset = 0;
            self.input_same = false;
            self.done = self.flushed;
        } else {
            self.input_same = true;
        }
    }
}

impl Filter for CipherFilter {
    fn filter_type(&self) -> FilterType {
        CIPHER_FILTER_TYPE
    }

    fn process_in_out(&mut self, input: Option<&[u8]>, output: &mut Buffer) -> Result<()> {
        // Re-presented input was already processed; just keep draining
        if self.input_same {
            self.drain(output);
            return Ok(());
        }

        match input {
            Some(input) => {
                let cipher = self.cipher.as_mut().ok_or_else(|| {
                    FilterError::Assert("cipher filter used after flush".to_string())
                })?;

                cipher.process(input, &mut self.pending)?;
            }
            None => {
                if !self.flushed {
                    let cipher = self.cipher.take().ok_or_else(|| {
                        FilterError::Assert("cipher filter flushed twice".to_string())
                    })?;

                    cipher.flush(&mut self.pending)?;
                    self.flushed = true;
                }
            }
        }

        self.drain(output);
        Ok(())
    }

    fn done(&self) -> bool {
        self.done && !self.input_same
    }

    fn input_same(&self) -> bool {
        self.input_same
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::group::FilterGroup;

    fn run_group(group: &mut FilterGroup, input: &[u8]) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut output = Buffer::new(32);

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
    fn encrypt_then_decrypt_round_trips() {
        let plaintext = b"filter stage round trip across the cipher boundary";

        let mut encrypt_group = FilterGroup::new();
        encrypt_group.add(Box::new(CipherFilter::new(CipherMode::Encrypt, b"key")));
        encrypt_group.open().unwrap();
        let ciphertext = run_group(&mut encrypt_group, plaintext);
        encrypt_group.close().unwrap();

        assert_ne!(ciphertext, plaintext);
        assert_eq!(&ciphertext[..8], b"Salted__");

        let mut decrypt_group = FilterGroup::new();
        decrypt_group.add(Box::new(CipherFilter::new(CipherMode::Decrypt, b"key")));
        decrypt_group.open().unwrap();
        let decrypted = run_group(&mut decrypt_group, &ciphertext);
        decrypt_group.close().unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn decrypt_one_byte_at_a_time_matches_single_feed() {
        let plaintext = b"one byte at a time behaves identically";

        let mut encrypt_group = FilterGroup::new();
        encrypt_group.add(Box::new(CipherFilter::new(CipherMode::Encrypt, b"key")));
        encrypt_group.open().unwrap();
        let ciphertext = run_group(&mut encrypt_group, plaintext);

        let mut group = FilterGroup::new();
        group.add(Box::new(CipherFilter::new(CipherMode::Decrypt, b"key")));
        group.open().unwrap();

        let mut decrypted = Vec::new();
        let mut output = Buffer::new(64);

        for byte in &ciphertext {
            loop {
                group
                    .process(Some(std::slice::from_ref(byte)), &mut output)
                    .unwrap();
                decrypted.extend_from_slice(output.as_slice());
                output.clear();

                if !group.input_same() {
                    break;
                }
            }
        }

        while !group.done() {
            group.process(None, &mut output).unwrap();
            decrypted.extend_from_slice(output.as_slice());
            output.clear();
        }

        assert_eq!(decrypted, plaintext);
    }
}
