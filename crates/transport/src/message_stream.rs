//! Message-oriented duplex consumed by the multiplexer.

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{ProtocolError, Result};

use crate::stream::SecureStream;

/// An ordered, reliable stream of discrete messages.
#[async_trait]
pub trait MessageStream: Send + Sync + 'static {
    /// Queues a message; `Ok(false)` asks the caller to wait for [`drained`](Self::drained).
    fn write(&self, message: Bytes) -> Result<bool>;

    /// Receives the next message; `Ok(None)` once the peer ended.
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Resolves once queued messages were handed to the transport.
    async fn drained(&self) -> bool;

    /// Ends the write side after queued messages.
    fn end(&self);

    /// Tears the stream down.
    fn destroy(&self, error: Option<ProtocolError>);

    fn is_destroyed(&self) -> bool;

    /// Resolves once the stream closed, with the error that destroyed it.
    async fn closed(&self) -> Result<()>;
}

#[async_trait]
impl MessageStream for SecureStream {
    fn write(&self, message: Bytes) -> Result<bool> {
        SecureStream::write(self, message)
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        SecureStream::recv(self).await
    }

    async fn drained(&self) -> bool {
        SecureStream::drained(self).await
    }

    fn end(&self) {
        SecureStream::end(self)
    }

    fn destroy(&self, error: Option<ProtocolError>) {
        SecureStream::destroy(self, error)
    }

    fn is_destroyed(&self) -> bool {
        SecureStream::is_destroyed(self)
    }

    async fn closed(&self) -> Result<()> {
        SecureStream::closed(self).await
    }
}
