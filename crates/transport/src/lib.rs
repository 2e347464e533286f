//! # Tunnelmux Transport
//!
//! Async half of tunnelmux, built on tokio: an encrypted, framed message
//! stream over any byte transport, and a multiplexer that runs many typed
//! channels over one such stream.
//!
//! ## Overview
//!
//! - [`SecureStream`]: Noise handshake, id header exchange, then
//!   XChaCha20-Poly1305 messages with keep-alive, inactivity timeout and an
//!   optional unordered side channel for datagrams
//! - [`Mux`]: channel pairing by protocol and id, batching, and a byte budget
//!   for messages that arrive before their channel exists
//! - [`Channel`]: typed messages with plain or async handlers
//!
//! ## Example
//!
//! ```rust,no_run
//! use protocol::encoding::Utf8;
//! use transport::{Mux, SecureStream, StreamOptions};
//!
//! # async fn run(socket: tokio::net::TcpStream) -> anyhow::Result<()> {
//! let stream = SecureStream::new(true, socket, StreamOptions::default())?;
//! let mux = Mux::new(stream);
//!
//! let channel = mux.channel("echo").create().expect("mux is alive");
//! let greeting = channel.add_message(Utf8, |text, _channel| {
//!     println!("peer said {text}");
//!     Ok(())
//! });
//! channel.open(None)?;
//! greeting.send(&"hello".to_string())?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod config;
pub mod logging;
pub mod memory;
pub mod message_stream;
pub mod mux;
pub mod raw;
pub mod stream;

pub use channel::{Channel, ChannelBuilder, Message};
pub use config::{Config, ConfigError, LoggingConfig, MuxConfig, StreamConfig};
pub use message_stream::MessageStream;
pub use mux::{Mux, MuxOptions};
pub use raw::{DatagramSocket, RawStream, SupportsContentSizeHint};
pub use stream::{
    PrecomputedHandshake, SecureStream, StartOptions, StreamInfo, StreamObserver, StreamOptions,
    MAX_MESSAGE_SIZE,
};
