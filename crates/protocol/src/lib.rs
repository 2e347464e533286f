//! # Tunnelmux Protocol Library
//!
//! Sans-IO building blocks of the tunnelmux transport: everything needed to
//! speak the wire protocol without owning a socket or a runtime.
//!
//! ## Overview
//!
//! - **Noise Handshake**: Symmetric and handshake state over Ed25519 or X25519
//! - **Stream Encryption**: XChaCha20-Poly1305 after the handshake, plus an
//!   unordered box for datagrams
//! - **Framing**: 24-bit little-endian length prefix with an incremental parser
//! - **Multiplexing**: Compact encoding and the channel control messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Channel messages (codecs)        │  encoding
//! ├─────────────────────────────────────────┤
//! │     Multiplexer control / batches       │  control
//! ├─────────────────────────────────────────┤
//! │   Stream cipher (XChaCha20-Poly1305)    │  secretstream, unordered
//! ├─────────────────────────────────────────┤
//! │     Noise handshake (ChaChaPoly)        │  noise, handshake, cipher
//! ├─────────────────────────────────────────┤
//! │         uint24 framing                  │  framing
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{FrameParser, KeyPair, Pattern, StreamHandshake};
//! use bytes::Bytes;
//!
//! let mut client = StreamHandshake::new(true, KeyPair::generate(), None, Pattern::XX, None).unwrap();
//! let mut server = StreamHandshake::new(false, KeyPair::generate(), None, Pattern::XX, None).unwrap();
//!
//! let mut parser = FrameParser::new();
//! let mut wire = client.start().unwrap().reply;
//! let mut turn = 0;
//! while let Some(frame) = wire.take() {
//!     let message = parser.push(Bytes::from(frame)).unwrap().remove(0);
//!     let peer = if turn % 2 == 0 { &mut server } else { &mut client };
//!     wire = peer.recv(&message).unwrap().reply;
//!     turn += 1;
//! }
//! assert_eq!(turn, 3);
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Key pairs, curves and hashing helpers
//! - [`cipher`]: Noise cipher state
//! - [`noise`]: Noise handshake state machine
//! - [`handshake`]: Framed handshake driver for streams
//! - [`framing`]: Frame codec and parser
//! - [`secretstream`]: Post-handshake stream cipher and id header
//! - [`unordered`]: Datagram encryption
//! - [`encoding`]: Compact encoding and message codecs
//! - [`control`]: Multiplexer wire format
//! - [`error`]: Error types

pub mod cipher;
pub mod control;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod noise;
pub mod secretstream;
pub mod unordered;

pub use cipher::{CipherState, KEY_LENGTH, MAX_NOISE_MESSAGE_SIZE, TAG_LENGTH};
pub use control::{BatchEncoder, ControlMessage, Frame, OpenMessage, CONTROL_CHANNEL};
pub use crypto::{Curve, Ed25519, KeyPair, X25519, PUBLIC_KEY_LENGTH};
pub use encoding::{Codec, State};
pub use error::{ProtocolError, Result};
pub use framing::{FrameParser, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use handshake::{HandshakeStep, StreamHandshake};
pub use noise::{
    HandshakeOptions, HandshakePhase, HandshakeResult, HandshakeState, Pattern, HASH_LENGTH,
    PSK_LENGTH,
};
pub use secretstream::{Decryptor, Encryptor, ABYTES, HEADER_BYTES, ID_HEADER_BYTES};
pub use unordered::UnorderedBox;
