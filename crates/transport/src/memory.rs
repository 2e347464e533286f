//! In-process transports.
//!
//! [`raw_pair`] connects two secure streams through a tokio duplex pipe with
//! an attached datagram channel. [`message_pair`] skips the encryption layer
//! entirely and hands whole messages across, which is what multiplexer tests
//! want.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use protocol::{ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, watch, Notify};

use crate::message_stream::MessageStream;
use crate::raw::{DatagramSocket, RawStream, SupportsContentSizeHint};

/// Packets buffered per direction before `try_send` reports a full socket.
const DATAGRAM_CAPACITY: usize = 64;

/// One end of an in-memory raw transport.
#[derive(Debug)]
pub struct MemoryRaw {
    stream: DuplexStream,
    datagrams: Arc<MemoryDatagrams>,
    content_hint: Option<Arc<ContentSizeRecorder>>,
}

/// Creates two connected raw transports with datagram support.
pub fn raw_pair(capacity: usize) -> (MemoryRaw, MemoryRaw) {
    let (a, b) = tokio::io::duplex(capacity);
    let (a_tx, b_rx) = mpsc::channel(DATAGRAM_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(DATAGRAM_CAPACITY);
    (
        MemoryRaw {
            stream: a,
            datagrams: Arc::new(MemoryDatagrams::new(a_tx, a_rx)),
            content_hint: None,
        },
        MemoryRaw {
            stream: b,
            datagrams: Arc::new(MemoryDatagrams::new(b_tx, b_rx)),
            content_hint: None,
        },
    )
}

impl MemoryRaw {
    /// Records every content size hint the stream reports.
    pub fn with_content_hint(mut self) -> (Self, Arc<ContentSizeRecorder>) {
        let recorder = Arc::new(ContentSizeRecorder::default());
        self.content_hint = Some(recorder.clone());
        (self, recorder)
    }

    /// Handle to this end's datagram socket.
    pub fn datagram_socket(&self) -> Arc<MemoryDatagrams> {
        self.datagrams.clone()
    }
}

impl AsyncRead for MemoryRaw {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryRaw {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl RawStream for MemoryRaw {
    fn content_size_hint(&self) -> Option<Arc<dyn SupportsContentSizeHint>> {
        self.content_hint
            .clone()
            .map(|hint| hint as Arc<dyn SupportsContentSizeHint>)
    }

    fn datagrams(&self) -> Option<Arc<dyn DatagramSocket>> {
        Some(self.datagrams.clone())
    }
}

/// Datagram half of a [`MemoryRaw`].
#[derive(Debug)]
pub struct MemoryDatagrams {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl MemoryDatagrams {
    fn new(tx: mpsc::Sender<Bytes>, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl DatagramSocket for MemoryDatagrams {
    fn try_send(&self, packet: Bytes) -> io::Result<bool> {
        match self.tx.try_send(packet) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "datagram peer gone"))
            }
        }
    }

    async fn send(&self, packet: Bytes) -> io::Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "datagram peer gone"))
    }

    async fn recv(&self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// Collects content size hints.
#[derive(Debug, Default)]
pub struct ContentSizeRecorder {
    values: Mutex<Vec<usize>>,
}

impl ContentSizeRecorder {
    /// Hints received so far.
    pub fn values(&self) -> Vec<usize> {
        self.values
            .lock()
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}

impl SupportsContentSizeHint for ContentSizeRecorder {
    fn set_content_size(&self, remaining: usize) {
        if let Ok(mut values) = self.values.lock() {
            values.push(remaining);
        }
    }
}

/// Accounting shared by the writer of one direction and its reader.
#[derive(Debug)]
struct Direction {
    queued: AtomicUsize,
    drain: Notify,
}

#[derive(Debug)]
struct Side {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outgoing: Arc<Direction>,
    incoming: Arc<Direction>,
    read_ended: AtomicBool,
    write_ended: AtomicBool,
    error: Mutex<Option<ProtocolError>>,
    closed: watch::Sender<bool>,
    high_water_mark: usize,
}

/// One end of an in-memory message stream.
#[derive(Debug, Clone)]
pub struct MemoryMessageStream {
    side: Arc<Side>,
}

/// Default backpressure threshold for [`message_pair`].
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Creates two connected message streams.
pub fn message_pair() -> (MemoryMessageStream, MemoryMessageStream) {
    message_pair_with_high_water_mark(DEFAULT_HIGH_WATER_MARK)
}

/// Creates two connected message streams that report backpressure once
/// `high_water_mark` bytes are unread.
pub fn message_pair_with_high_water_mark(
    high_water_mark: usize,
) -> (MemoryMessageStream, MemoryMessageStream) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_to_b = Arc::new(Direction {
        queued: AtomicUsize::new(0),
        drain: Notify::new(),
    });
    let b_to_a = Arc::new(Direction {
        queued: AtomicUsize::new(0),
        drain: Notify::new(),
    });
    let side = |tx, rx, outgoing, incoming| MemoryMessageStream {
        side: Arc::new(Side {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            outgoing,
            incoming,
            read_ended: AtomicBool::new(false),
            write_ended: AtomicBool::new(false),
            error: Mutex::new(None),
            closed: watch::channel(false).0,
            high_water_mark,
        }),
    };
    (
        side(a_tx, a_rx, a_to_b.clone(), b_to_a.clone()),
        side(b_tx, b_rx, b_to_a, a_to_b),
    )
}

impl Side {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn error(&self) -> Option<ProtocolError> {
        self.error.lock().ok().and_then(|error| error.clone())
    }

    fn close_if_done(&self) {
        if self.read_ended.load(Ordering::Acquire) && self.write_ended.load(Ordering::Acquire) {
            self.closed.send_replace(true);
        }
    }
}

#[async_trait]
impl MessageStream for MemoryMessageStream {
    fn write(&self, message: Bytes) -> Result<bool> {
        if self.side.is_closed() {
            return Err(self.side.error().unwrap_or(ProtocolError::Destroyed));
        }
        let tx = self.side.tx.lock().ok().and_then(|tx| tx.clone());
        let Some(tx) = tx else {
            return Err(ProtocolError::ConnectionClosed("write after end".into()));
        };
        let len = message.len();
        let queued = self.side.outgoing.queued.fetch_add(len, Ordering::AcqRel) + len;
        if tx.send(message).is_err() {
            // The peer is gone; nothing will ever read this.
            self.side.outgoing.queued.fetch_sub(len, Ordering::AcqRel);
            self.side.outgoing.drain.notify_waiters();
        }
        Ok(queued < self.side.high_water_mark)
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        let mut closed = self.side.closed.subscribe();
        let mut rx = self.side.rx.lock().await;
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => {
                    let before = self.side.incoming.queued.fetch_sub(message.len(), Ordering::AcqRel);
                    if before == message.len() {
                        self.side.incoming.drain.notify_waiters();
                    }
                    Ok(Some(message))
                }
                None => {
                    self.side.read_ended.store(true, Ordering::Release);
                    self.side.close_if_done();
                    match self.side.error() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    }
                }
            },
            _ = closed.wait_for(|closed| *closed) => match self.side.error() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    async fn drained(&self) -> bool {
        loop {
            let notified = self.side.outgoing.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.side.is_closed() {
                return false;
            }
            if self.side.outgoing.queued.load(Ordering::Acquire) == 0 {
                return true;
            }
            notified.await;
        }
    }

    fn end(&self) {
        if let Ok(mut tx) = self.side.tx.lock() {
            tx.take();
        }
        self.side.write_ended.store(true, Ordering::Release);
        self.side.close_if_done();
    }

    fn destroy(&self, error: Option<ProtocolError>) {
        if self.side.is_closed() {
            return;
        }
        if let Ok(mut slot) = self.side.error.lock() {
            if slot.is_none() {
                *slot = Some(error.unwrap_or(ProtocolError::Destroyed));
            }
        }
        if let Ok(mut tx) = self.side.tx.lock() {
            tx.take();
        }
        self.side.closed.send_replace(true);
        self.side.outgoing.drain.notify_waiters();
    }

    fn is_destroyed(&self) -> bool {
        self.side.is_closed()
    }

    async fn closed(&self) -> Result<()> {
        let mut closed = self.side.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
        match self.side.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
