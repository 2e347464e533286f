//! Raw transports a secure stream can run over.
//!
//! Anything that is `AsyncRead + AsyncWrite` qualifies. Optional capabilities
//! are exposed as typed accessors that return `None` by default, so the
//! stream asks the transport what it supports instead of probing for it.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// Receives the number of payload bytes still missing for the frame being
/// read, or zero at a frame boundary.
pub trait SupportsContentSizeHint: Send + Sync {
    fn set_content_size(&self, remaining: usize);
}

/// Unreliable, unordered packet delivery next to the byte stream.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Sends a packet if it can go out immediately.
    fn try_send(&self, packet: Bytes) -> io::Result<bool>;

    /// Sends a packet, waiting for room if needed.
    async fn send(&self, packet: Bytes) -> io::Result<()>;

    /// Waits for the next packet; `None` once the socket is closed.
    async fn recv(&self) -> io::Result<Option<Bytes>>;
}

/// A reliable ordered byte stream owned by one secure stream.
pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Returns the content size hint receiver, if the transport wants one.
    fn content_size_hint(&self) -> Option<Arc<dyn SupportsContentSizeHint>> {
        None
    }

    /// Returns the datagram socket paired with this stream, if any.
    fn datagrams(&self) -> Option<Arc<dyn DatagramSocket>> {
        None
    }
}

impl RawStream for TcpStream {}

impl RawStream for DuplexStream {}

impl<T: RawStream + ?Sized> RawStream for Box<T> {
    fn content_size_hint(&self) -> Option<Arc<dyn SupportsContentSizeHint>> {
        (**self).content_size_hint()
    }

    fn datagrams(&self) -> Option<Arc<dyn DatagramSocket>> {
        (**self).datagrams()
    }
}
