//! Noise cipher state: one direction of ChaCha20-Poly1305 with a counter nonce.
//!
//! ## Nonce Layout
//! ```text
//! 0        4                8        12
//! +--------+----------------+--------+
//! | zeroes | counter (u32LE)| zeroes |
//! +--------+----------------+--------+
//! ```
//!
//! Without a key the state passes data through unchanged, which is how
//! handshake messages travel before the first DH mix.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use zeroize::Zeroizing;

use crate::error::{ProtocolError, Result};

/// Length of a cipher key in bytes.
pub const KEY_LENGTH: usize = 32;

/// Length of the Poly1305 authentication tag.
pub const TAG_LENGTH: usize = 16;

/// Maximum size of a single Noise message.
pub const MAX_NOISE_MESSAGE_SIZE: usize = 65535;

/// One direction of authenticated encryption with a monotonic nonce.
#[derive(Default)]
pub struct CipherState {
    key: Option<Zeroizing<[u8; KEY_LENGTH]>>,
    nonce: u32,
}

impl CipherState {
    /// Creates a cipher state with no key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cipher state with an active key.
    pub fn with_key(key: [u8; KEY_LENGTH]) -> Self {
        let mut state = Self::new();
        state.initialize_key(key);
        state
    }

    /// Sets the active key and resets the nonce to zero.
    pub fn initialize_key(&mut self, key: [u8; KEY_LENGTH]) {
        self.key = Some(Zeroizing::new(key));
        self.nonce = 0;
    }

    /// Returns whether a key has been set.
    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Returns the nonce that the next operation will use.
    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    /// Encrypts `plaintext`, binding `ad` as associated data.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_vec());
        };

        let size = plaintext.len() + TAG_LENGTH;
        if size > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_NOISE_MESSAGE_SIZE,
            });
        }
        let nonce = next_nonce(self.nonce)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad: ad })
            .map_err(|_| ProtocolError::Encryption("chacha20-poly1305 seal failed".into()))?;

        self.nonce += 1;
        Ok(ciphertext)
    }

    /// Decrypts `ciphertext`, verifying it against `ad`.
    pub fn decrypt(&mut self, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let Some(key) = &self.key else {
            return Ok(ciphertext.to_vec());
        };

        if ciphertext.len() > MAX_NOISE_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: ciphertext.len(),
                max: MAX_NOISE_MESSAGE_SIZE,
            });
        }
        if ciphertext.len() < TAG_LENGTH {
            return Err(ProtocolError::Decryption(format!(
                "ciphertext of {} bytes is shorter than the tag",
                ciphertext.len()
            )));
        }
        let nonce = next_nonce(self.nonce)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
        let plaintext = cipher.decrypt(
            &nonce,
            Payload {
                msg: ciphertext,
                aad: ad,
            },
        )?;

        self.nonce += 1;
        Ok(plaintext)
    }

    /// Drops the key, zeroizing it.
    pub fn clear(&mut self) {
        self.key = None;
        self.nonce = 0;
    }
}

fn next_nonce(counter: u32) -> Result<Nonce> {
    if counter == u32::MAX {
        return Err(ProtocolError::NonceExhausted);
    }
    let mut bytes = [0u8; 12];
    bytes[4..8].copy_from_slice(&counter.to_le_bytes());
    Ok(*Nonce::from_slice(&bytes))
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("has_key", &self.has_key())
            .field("key", &"[redacted]")
            .finish()
    }
}
