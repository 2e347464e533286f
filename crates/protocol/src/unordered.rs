//! Encryption for the unordered side channel.
//!
//! Datagrams may be lost or reordered, so each packet carries its own
//! nonce counter in the clear:
//!
//! ```text
//! +--------------------+------------------------------------+
//! | counter (u64, LE)  | XChaCha20-Poly1305 ciphertext+tag  |
//! +--------------------+------------------------------------+
//! ```
//!
//! Keys are derived per direction from the handshake hash so they never
//! collide with the ordered stream keys.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::crypto::keyed_hash;
use crate::error::{ProtocolError, Result};
use crate::secretstream::ABYTES;

/// Size of the clear-text counter prefix.
pub const COUNTER_BYTES: usize = 8;

/// Smallest valid packet.
pub const MIN_PACKET_SIZE: usize = COUNTER_BYTES + ABYTES;

const INITIATOR_LABEL: &[u8] = b"unordered/initiator";
const RESPONDER_LABEL: &[u8] = b"unordered/responder";

fn packet_nonce(counter: u64) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..COUNTER_BYTES].copy_from_slice(&counter.to_le_bytes());
    XNonce::from(nonce)
}

/// Seals and opens unordered packets for one end of a stream.
pub struct UnorderedBox {
    tx: XChaCha20Poly1305,
    rx: XChaCha20Poly1305,
    counter: u64,
}

impl UnorderedBox {
    /// Derives both directions from the handshake hash.
    pub fn new(handshake_hash: &[u8], is_initiator: bool) -> Result<Self> {
        let initiator = keyed_hash(handshake_hash, INITIATOR_LABEL)?;
        let responder = keyed_hash(handshake_hash, RESPONDER_LABEL)?;
        let (tx, rx) = if is_initiator {
            (initiator, responder)
        } else {
            (responder, initiator)
        };
        // Start in the lower half so a long-lived stream has room to count.
        let counter = OsRng.next_u64() >> 1;
        Ok(Self {
            tx: XChaCha20Poly1305::new(Key::from_slice(&tx)),
            rx: XChaCha20Poly1305::new(Key::from_slice(&rx)),
            counter,
        })
    }

    /// Encrypts one datagram.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if self.counter == u64::MAX {
            return Err(ProtocolError::NonceExhausted);
        }
        let counter = self.counter;
        let ciphertext = self
            .tx
            .encrypt(&packet_nonce(counter), plaintext)
            .map_err(|_| ProtocolError::Encryption("unordered seal failed".into()))?;
        self.counter += 1;

        let mut packet = Vec::with_capacity(COUNTER_BYTES + ciphertext.len());
        packet.extend_from_slice(&counter.to_le_bytes());
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    /// Decrypts one datagram sealed by the peer.
    pub fn open(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < MIN_PACKET_SIZE {
            return Err(ProtocolError::InvalidFrame(format!(
                "unordered packet of {} bytes is too short",
                packet.len()
            )));
        }
        let mut counter = [0u8; COUNTER_BYTES];
        counter.copy_from_slice(&packet[..COUNTER_BYTES]);
        let plaintext = self
            .rx
            .decrypt(&packet_nonce(u64::from_le_bytes(counter)), &packet[COUNTER_BYTES..])?;
        Ok(plaintext)
    }
}

impl std::fmt::Debug for UnorderedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnorderedBox").finish_non_exhaustive()
    }
}
