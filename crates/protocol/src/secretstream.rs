//! Post-handshake stream encryption.
//!
//! After the Noise handshake each side sends one id header frame:
//!
//! ```text
//! +--------------------------+-----------------------------+
//! | stream id (32 bytes)     | cipher header (24 bytes)    |
//! +--------------------------+-----------------------------+
//! ```
//!
//! The stream id binds the frame to the handshake transcript and to the
//! sender's role. The cipher header seeds the sender's XChaCha20-Poly1305
//! nonce sequence; every later frame is `ciphertext || tag` under the nonce
//! `header XOR counter` where the counter occupies the last 8 bytes.

use std::fmt;

use chacha20poly1305::aead::{Aead, AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};

use crate::cipher::KEY_LENGTH;
use crate::crypto::{keyed_hash, namespace, random_bytes};
use crate::error::{ProtocolError, Result};

/// Size of the cipher header exchanged after the handshake.
pub const HEADER_BYTES: usize = 24;

/// Authentication tag size appended to every message.
pub const ABYTES: usize = 16;

/// Size of the stream id.
pub const STREAM_ID_BYTES: usize = 32;

/// Size of the id header frame payload.
pub const ID_HEADER_BYTES: usize = STREAM_ID_BYTES + HEADER_BYTES;

/// Namespace from which the role labels of the stream id are derived.
pub const STREAM_NAMESPACE: &[u8] = b"tunnelmux/secret-stream";

/// Computes the stream id sent by the side with the given role.
pub fn stream_id(handshake_hash: &[u8], is_initiator: bool) -> Result<[u8; STREAM_ID_BYTES]> {
    let labels = namespace(STREAM_NAMESPACE, 2);
    let label = if is_initiator { &labels[0] } else { &labels[1] };
    keyed_hash(handshake_hash, label)
}

/// Builds the id header payload for our side.
pub fn id_header(
    handshake_hash: &[u8],
    is_initiator: bool,
    header: &[u8; HEADER_BYTES],
) -> Result<[u8; ID_HEADER_BYTES]> {
    let mut out = [0u8; ID_HEADER_BYTES];
    out[..STREAM_ID_BYTES].copy_from_slice(&stream_id(handshake_hash, is_initiator)?);
    out[STREAM_ID_BYTES..].copy_from_slice(header);
    Ok(out)
}

/// Validates the peer's id header and returns its cipher header.
///
/// `is_initiator` is our own role; the peer's id is expected for the other one.
pub fn verify_id_header(
    handshake_hash: &[u8],
    is_initiator: bool,
    message: &[u8],
) -> Result<[u8; HEADER_BYTES]> {
    if message.len() != ID_HEADER_BYTES {
        return Err(ProtocolError::InvalidHeader(format!(
            "expected {} bytes, got {}",
            ID_HEADER_BYTES,
            message.len()
        )));
    }
    let expected = stream_id(handshake_hash, !is_initiator)?;
    if message[..STREAM_ID_BYTES] != expected {
        return Err(ProtocolError::InvalidHeader("stream id mismatch".into()));
    }
    let mut header = [0u8; HEADER_BYTES];
    header.copy_from_slice(&message[STREAM_ID_BYTES..]);
    Ok(header)
}

fn message_nonce(header: &[u8; HEADER_BYTES], counter: u64) -> Result<XNonce> {
    if counter == u64::MAX {
        return Err(ProtocolError::NonceExhausted);
    }
    let mut nonce = *header;
    for (byte, c) in nonce[16..].iter_mut().zip(counter.to_le_bytes()) {
        *byte ^= c;
    }
    Ok(XNonce::from(nonce))
}

/// Sending half of the stream cipher.
pub struct Encryptor {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_BYTES],
    counter: u64,
}

impl Encryptor {
    /// Creates an encryptor with a random header.
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self::with_header(key, random_bytes())
    }

    /// Creates an encryptor with a fixed header.
    pub fn with_header(key: &[u8; KEY_LENGTH], header: [u8; HEADER_BYTES]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            header,
            counter: 0,
        }
    }

    /// Returns the header the peer needs to decrypt our messages.
    pub fn header(&self) -> &[u8; HEADER_BYTES] {
        &self.header
    }

    /// Encrypts `buffer` in place and returns the tag to append.
    pub fn encrypt_in_place(&mut self, buffer: &mut [u8]) -> Result<[u8; ABYTES]> {
        let nonce = message_nonce(&self.header, self.counter)?;
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, &[], buffer)
            .map_err(|_| ProtocolError::Encryption("xchacha20-poly1305 seal failed".into()))?;
        self.counter += 1;
        Ok(tag.into())
    }

    /// Encrypts a message, returning `ciphertext || tag`.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(plaintext.len() + ABYTES);
        out.extend_from_slice(plaintext);
        let tag = self.encrypt_in_place(&mut out)?;
        out.extend_from_slice(&tag);
        Ok(out)
    }
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryptor")
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

/// Receiving half of the stream cipher.
pub struct Decryptor {
    cipher: XChaCha20Poly1305,
    header: Option<[u8; HEADER_BYTES]>,
    counter: u64,
}

impl Decryptor {
    /// Creates a decryptor that still waits for the peer's header.
    pub fn new(key: &[u8; KEY_LENGTH]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            header: None,
            counter: 0,
        }
    }

    /// Installs the peer's header.
    pub fn init(&mut self, header: [u8; HEADER_BYTES]) {
        self.header = Some(header);
        self.counter = 0;
    }

    /// Returns whether the header has been received.
    pub fn is_ready(&self) -> bool {
        self.header.is_some()
    }

    /// Decrypts `ciphertext || tag`.
    pub fn decrypt(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| ProtocolError::Decryption("stream header not received".into()))?;
        if message.len() < ABYTES {
            return Err(ProtocolError::InvalidFrame(format!(
                "message of {} bytes is shorter than the tag",
                message.len()
            )));
        }
        let nonce = message_nonce(header, self.counter)?;
        let plaintext = self.cipher.decrypt(&nonce, message)?;
        self.counter += 1;
        Ok(plaintext)
    }

    /// Decrypts `ciphertext || tag` in place, returning the plaintext length.
    pub fn decrypt_in_place(&mut self, message: &mut [u8]) -> Result<usize> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| ProtocolError::Decryption("stream header not received".into()))?;
        if message.len() < ABYTES {
            return Err(ProtocolError::InvalidFrame(format!(
                "message of {} bytes is shorter than the tag",
                message.len()
            )));
        }
        let nonce = message_nonce(header, self.counter)?;
        let split = message.len() - ABYTES;
        let (body, tag) = message.split_at_mut(split);
        self.cipher
            .decrypt_in_place_detached(&nonce, &[], body, Tag::from_slice(tag))?;
        self.counter += 1;
        Ok(split)
    }
}

impl fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decryptor")
            .field("ready", &self.is_ready())
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}
