//! Encrypted message stream over a raw transport.
//!
//! A [`SecureStream`] is a cheap handle. The socket itself is owned by a
//! driver task that performs the handshake, exchanges the id headers, and
//! then shuttles encrypted frames between the raw transport and the handle:
//!
//! ```text
//!            commands (write / flush / end / destroy / timers)
//!  handle ──────────────────────────────────────────────▶ driver ──▶ raw write half
//!  handle ◀────────────── messages (bounded) ─────────── driver ◀── raw read half
//! ```
//!
//! Reads and writes are polled from one `select!`, so a peer that stops
//! reading can never stall delivery of what it already sent us.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use protocol::framing::{encode_frame, encode_header, FrameParser, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use protocol::secretstream::{self, Decryptor, Encryptor, ABYTES, ID_HEADER_BYTES};
use protocol::{
    HandshakeResult, KeyPair, Pattern, ProtocolError, Result, StreamHandshake, UnorderedBox,
    HASH_LENGTH, MAX_NOISE_MESSAGE_SIZE, PSK_LENGTH, PUBLIC_KEY_LENGTH,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::{sleep_until, Instant};

use crate::config::{ConfigError, StreamConfig};
use crate::raw::{DatagramSocket, RawStream, SupportsContentSizeHint};

/// Buffer size for reading from the raw transport.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Decrypted messages held by the driver before it stops reading.
const INBOX_LIMIT: usize = 64;

/// Capacity of the channel between the driver and the handle.
const INCOMING_CAPACITY: usize = 16;

/// Unordered messages buffered for the handle; extra packets are dropped.
const UNORDERED_CAPACITY: usize = 256;

/// Largest plaintext a single write can carry.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE - ABYTES;

/// Handshake keys computed ahead of time, skipping the Noise exchange.
pub type PrecomputedHandshake = HandshakeResult;

/// Snapshot of a stream's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub is_initiator: bool,
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    pub remote_public_key: Option<[u8; PUBLIC_KEY_LENGTH]>,
    pub handshake_hash: Option<[u8; HASH_LENGTH]>,
}

/// Lifecycle notifications.
pub trait StreamObserver: Send + Sync {
    /// The Noise handshake finished; the id headers are not exchanged yet.
    fn on_handshake(&self, _info: &StreamInfo) {}

    /// The peer's id header verified; messages can flow.
    fn on_connect(&self, _info: &StreamInfo) {}

    /// The stream closed, with the error that destroyed it if any.
    fn on_close(&self, _error: Option<&ProtocolError>) {}
}

/// Options for creating a stream.
#[derive(Clone)]
pub struct StreamOptions {
    /// Handshake pattern.
    pub pattern: Pattern,
    /// Static key pair; generated when absent.
    pub key_pair: Option<KeyPair>,
    /// The responder's key, required by the initiator of `IK`.
    pub remote_public_key: Option<[u8; PUBLIC_KEY_LENGTH]>,
    /// Pre-shared key for `psk` patterns.
    pub psk: Option<[u8; PSK_LENGTH]>,
    /// Keep-alive interval; zero disables.
    pub keep_alive: Duration,
    /// Inactivity timeout; zero disables.
    pub timeout: Duration,
    /// Queued plaintext bytes after which `write` reports backpressure.
    pub high_water_mark: usize,
    pub observer: Option<Arc<dyn StreamObserver>>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            pattern: Pattern::XX,
            key_pair: None,
            remote_public_key: None,
            psk: None,
            keep_alive: Duration::ZERO,
            timeout: Duration::ZERO,
            high_water_mark: 64 * 1024,
            observer: None,
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("pattern", &self.pattern)
            .field("key_pair", &self.key_pair)
            .field("remote_public_key", &self.remote_public_key.map(hex::encode))
            .field("psk", &self.psk.map(|_| "[redacted]"))
            .field("keep_alive", &self.keep_alive)
            .field("timeout", &self.timeout)
            .field("high_water_mark", &self.high_water_mark)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl StreamOptions {
    /// Builds options from the `[stream]` configuration section.
    pub fn from_config(config: &StreamConfig) -> std::result::Result<Self, ConfigError> {
        let pattern = config
            .pattern
            .parse()
            .map_err(|_| ConfigError::InvalidPattern(config.pattern.clone()))?;
        Ok(Self {
            pattern,
            keep_alive: Duration::from_millis(config.keep_alive_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            high_water_mark: config.high_water_mark,
            ..Default::default()
        })
    }
}

/// Options for [`SecureStream::start`].
#[derive(Debug, Default)]
pub struct StartOptions {
    /// Bytes already read from the raw transport.
    pub data: Option<Bytes>,
    /// Whether the raw transport already reached end of stream.
    pub ended: bool,
    /// Skip the Noise exchange and use these keys.
    pub handshake: Option<PrecomputedHandshake>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Opening,
    Connected,
    Closed,
}

enum Command {
    Write(Bytes),
    Flush(oneshot::Sender<bool>),
    SetTimeout(Duration),
    SetKeepAlive(Duration),
    End,
    Destroy(Option<ProtocolError>),
}

/// Driver inputs held until the stream is started.
struct Pending {
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::Sender<Bytes>,
    unordered: mpsc::Sender<Bytes>,
    options: StreamOptions,
    key_pair: KeyPair,
}

struct Shared {
    is_initiator: bool,
    public_key: Mutex<[u8; PUBLIC_KEY_LENGTH]>,
    remote_public_key: Mutex<Option<[u8; PUBLIC_KEY_LENGTH]>>,
    handshake_hash: Mutex<Option<[u8; HASH_LENGTH]>>,
    status: watch::Sender<Status>,
    connected: AtomicBool,
    ending: AtomicBool,
    error: Mutex<Option<ProtocolError>>,
    queued: AtomicUsize,
    drain: Notify,
    high_water_mark: usize,
    raw_bytes_read: AtomicU64,
    raw_bytes_written: AtomicU64,
    unordered_box: Mutex<Option<UnorderedBox>>,
    datagrams: Mutex<Option<Arc<dyn DatagramSocket>>>,
    observer: Option<Arc<dyn StreamObserver>>,
}

impl Shared {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            is_initiator: self.is_initiator,
            public_key: *lock(&self.public_key),
            remote_public_key: *lock(&self.remote_public_key),
            handshake_hash: *lock(&self.handshake_hash),
        }
    }

    fn is_closed(&self) -> bool {
        *self.status.borrow() == Status::Closed
    }

    fn error(&self) -> Option<ProtocolError> {
        lock(&self.error).clone()
    }

    /// Moves to the closed state once; later calls keep the first outcome.
    fn close(&self, error: Option<ProtocolError>) {
        let changed = self.status.send_if_modified(|status| {
            if *status == Status::Closed {
                return false;
            }
            if let Some(err) = &error {
                *lock(&self.error) = Some(err.clone());
            }
            *status = Status::Closed;
            true
        });
        if !changed {
            return;
        }
        lock(&self.unordered_box).take();
        self.drain.notify_waiters();

        match &error {
            Some(err) => tracing::debug!(initiator = self.is_initiator, error = %err, "Secure stream destroyed"),
            None => tracing::debug!(initiator = self.is_initiator, "Secure stream closed"),
        }
        if let Some(observer) = &self.observer {
            observer.on_close(error.as_ref());
        }
    }

    fn closed_error(&self) -> ProtocolError {
        self.error().unwrap_or(ProtocolError::Destroyed)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to an encrypted, framed, bidirectional message stream.
///
/// Clones share the same stream.
#[derive(Clone)]
pub struct SecureStream {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    incoming: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    unordered: Arc<tokio::sync::Mutex<mpsc::Receiver<Bytes>>>,
    pending: Arc<Mutex<Option<Pending>>>,
}

impl fmt::Debug for SecureStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureStream")
            .field("is_initiator", &self.shared.is_initiator)
            .field("status", &*self.shared.status.borrow())
            .finish_non_exhaustive()
    }
}

impl SecureStream {
    /// Creates a stream over `raw` and starts the handshake.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<R: RawStream>(is_initiator: bool, raw: R, options: StreamOptions) -> Result<Self> {
        let stream = Self::unstarted(is_initiator, options);
        stream.start(raw, StartOptions::default())?;
        Ok(stream)
    }

    /// Creates a stream that waits for [`start`](Self::start).
    ///
    /// Writes made before start are queued.
    pub fn unstarted(is_initiator: bool, options: StreamOptions) -> Self {
        let key_pair = options.key_pair.clone().unwrap_or_else(KeyPair::generate);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
        let (unordered_tx, unordered_rx) = mpsc::channel(UNORDERED_CAPACITY);
        let (status, _) = watch::channel(Status::Opening);

        let shared = Arc::new(Shared {
            is_initiator,
            public_key: Mutex::new(*key_pair.public_key()),
            remote_public_key: Mutex::new(options.remote_public_key),
            handshake_hash: Mutex::new(None),
            status,
            connected: AtomicBool::new(false),
            ending: AtomicBool::new(false),
            error: Mutex::new(None),
            queued: AtomicUsize::new(0),
            drain: Notify::new(),
            high_water_mark: options.high_water_mark,
            raw_bytes_read: AtomicU64::new(0),
            raw_bytes_written: AtomicU64::new(0),
            unordered_box: Mutex::new(None),
            datagrams: Mutex::new(None),
            observer: options.observer.clone(),
        });

        Self {
            shared,
            commands: commands_tx,
            incoming: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
            unordered: Arc::new(tokio::sync::Mutex::new(unordered_rx)),
            pending: Arc::new(Mutex::new(Some(Pending {
                commands: commands_rx,
                incoming: incoming_tx,
                unordered: unordered_tx,
                options,
                key_pair,
            }))),
        }
    }

    /// Binds the raw transport and spawns the driver.
    pub fn start<R: RawStream>(&self, raw: R, start: StartOptions) -> Result<()> {
        let pending = lock(&self.pending)
            .take()
            .ok_or_else(|| ProtocolError::Io("secure stream already started".into()))?;
        if self.shared.is_closed() {
            return Err(self.shared.closed_error());
        }

        if let Some(result) = &start.handshake {
            *lock(&self.shared.public_key) = result.public_key;
        }
        *lock(&self.shared.datagrams) = raw.datagrams();

        let driver = Driver::new(self.shared.clone(), raw, pending, start.handshake.is_some())?;
        tokio::spawn(driver.run(start));
        Ok(())
    }

    /// Returns whether this side initiated the handshake.
    pub fn is_initiator(&self) -> bool {
        self.shared.is_initiator
    }

    /// Our static public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        *lock(&self.shared.public_key)
    }

    /// The peer's static public key once known.
    pub fn remote_public_key(&self) -> Option<[u8; PUBLIC_KEY_LENGTH]> {
        *lock(&self.shared.remote_public_key)
    }

    /// The handshake transcript hash once the handshake completed.
    pub fn handshake_hash(&self) -> Option<[u8; HASH_LENGTH]> {
        *lock(&self.shared.handshake_hash)
    }

    /// Identity snapshot.
    pub fn info(&self) -> StreamInfo {
        self.shared.info()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire) && !self.shared.is_closed()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The error that destroyed the stream, if any.
    pub fn error(&self) -> Option<ProtocolError> {
        self.shared.error()
    }

    /// Total bytes read from the raw transport.
    pub fn raw_bytes_read(&self) -> u64 {
        self.shared.raw_bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written to the raw transport.
    pub fn raw_bytes_written(&self) -> u64 {
        self.shared.raw_bytes_written.load(Ordering::Relaxed)
    }

    /// Resolves true once connected, false if the stream closed first.
    pub async fn opened(&self) -> bool {
        let mut status = self.shared.status.subscribe();
        let _ = status.wait_for(|s| *s != Status::Opening).await;
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Resolves once the stream closed, with the error that destroyed it.
    pub async fn closed(&self) -> Result<()> {
        let mut status = self.shared.status.subscribe();
        let _ = status.wait_for(|s| *s == Status::Closed).await;
        match self.shared.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Queues a message.
    ///
    /// Returns `false` when queued bytes reached the high water mark; the
    /// message is still sent, but callers should wait for [`drained`](Self::drained).
    pub fn write(&self, message: impl Into<Bytes>) -> Result<bool> {
        let message = message.into();
        if self.shared.is_closed() {
            return Err(self.shared.closed_error());
        }
        if self.shared.ending.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed("write after end".into()));
        }
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: message.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let queued = self.shared.queued.fetch_add(message.len(), Ordering::AcqRel) + message.len();
        if self.commands.send(Command::Write(message)).is_err() {
            return Err(self.shared.closed_error());
        }
        Ok(queued < self.shared.high_water_mark)
    }

    /// Resolves once every queued message reached the raw transport.
    ///
    /// Returns false if the stream closed first.
    pub async fn drained(&self) -> bool {
        loop {
            let notified = self.shared.drain.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.is_closed() {
                return false;
            }
            if self.shared.queued.load(Ordering::Acquire) == 0 {
                return true;
            }
            notified.await;
        }
    }

    /// Resolves true once connected and every queued write was flushed to
    /// the raw transport; false if the stream is destroyed first.
    pub async fn flush(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.shared.is_closed() || self.commands.send(Command::Flush(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Sets the inactivity timeout; zero disables it.
    pub fn set_timeout(&self, timeout: Duration) {
        let _ = self.commands.send(Command::SetTimeout(timeout));
    }

    /// Sets the keep-alive interval; zero disables it.
    pub fn set_keep_alive(&self, interval: Duration) {
        let _ = self.commands.send(Command::SetKeepAlive(interval));
    }

    /// Half-closes the write side once queued messages are sent.
    pub fn end(&self) {
        if !self.shared.ending.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Command::End);
        }
    }

    /// Tears the stream down. Idempotent.
    pub fn destroy(&self, error: Option<ProtocolError>) {
        if self.shared.is_closed() {
            return;
        }
        if lock(&self.pending).take().is_some() {
            // Never started: there is no driver to do it.
            self.shared.close(Some(error.unwrap_or(ProtocolError::Destroyed)));
            return;
        }
        if let Err(mpsc::error::SendError(Command::Destroy(error))) =
            self.commands.send(Command::Destroy(error))
        {
            self.shared.close(Some(error.unwrap_or(ProtocolError::Destroyed)));
        }
    }

    /// Receives the next message; `Ok(None)` after the peer ended cleanly.
    pub async fn recv(&self) -> Result<Option<Bytes>> {
        let message = self.incoming.lock().await.recv().await;
        match message {
            Some(message) => Ok(Some(message)),
            None => match self.shared.error() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Sends an unordered message if the datagram socket has room.
    ///
    /// Returns false when the transport has no datagram support, the stream
    /// is not connected, or the packet could not be sent right away.
    pub fn try_send_unordered(&self, message: &[u8]) -> Result<bool> {
        let Some((socket, packet)) = self.seal_unordered(message)? else {
            return Ok(false);
        };
        Ok(socket.try_send(packet)?)
    }

    /// Sends an unordered message.
    ///
    /// Returns false when the transport has no datagram support or the
    /// stream is not connected.
    pub async fn send_unordered(&self, message: &[u8]) -> Result<bool> {
        let Some((socket, packet)) = self.seal_unordered(message)? else {
            return Ok(false);
        };
        socket.send(packet).await?;
        Ok(true)
    }

    fn seal_unordered(&self, message: &[u8]) -> Result<Option<(Arc<dyn DatagramSocket>, Bytes)>> {
        let Some(socket) = lock(&self.shared.datagrams).clone() else {
            return Ok(None);
        };
        let sealed = match lock(&self.shared.unordered_box).as_mut() {
            Some(unordered) => unordered.seal(message),
            None => return Ok(None),
        };
        match sealed {
            Ok(packet) => Ok(Some((socket, Bytes::from(packet)))),
            Err(err) => {
                tracing::warn!(error = %err, "Unordered send failed, destroying stream");
                self.destroy(Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Receives the next unordered message; `None` once the stream closed.
    pub async fn recv_unordered(&self) -> Option<Bytes> {
        self.unordered.lock().await.recv().await
    }
}

/// A frame waiting to be written.
struct Outgoing {
    data: Bytes,
    /// Plaintext bytes to release from the queued count once written.
    plaintext: usize,
}

enum Phase {
    Handshake(StreamHandshake),
    /// Waiting for the peer's id header.
    Header,
    Connected,
}

struct Driver<R: RawStream> {
    shared: Arc<Shared>,
    reader: ReadHalf<R>,
    writer: WriteHalf<R>,
    content_hint: Option<Arc<dyn SupportsContentSizeHint>>,
    datagrams: Option<Arc<dyn DatagramSocket>>,
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: Option<mpsc::Sender<Bytes>>,
    unordered: mpsc::Sender<Bytes>,
    phase: Phase,
    parser: FrameParser,
    encryptor: Option<Encryptor>,
    decryptor: Option<Decryptor>,
    read_buf: BytesMut,
    inbox: VecDeque<Bytes>,
    /// Plaintext written before the stream connected.
    pending_writes: VecDeque<Bytes>,
    outbox: VecDeque<Outgoing>,
    flush_waiters: Vec<oneshot::Sender<bool>>,
    keep_alive: Duration,
    timeout: Duration,
    keep_alive_deadline: Instant,
    timeout_deadline: Instant,
    read_ended: bool,
    end_requested: bool,
    write_ended: bool,
}

impl<R: RawStream> Driver<R> {
    fn new(shared: Arc<Shared>, raw: R, pending: Pending, precomputed: bool) -> Result<Self> {
        let content_hint = raw.content_size_hint();
        let datagrams = raw.datagrams();
        let (reader, writer) = tokio::io::split(raw);
        let phase = if precomputed {
            Phase::Header
        } else {
            Phase::Handshake(StreamHandshake::new(
                shared.is_initiator,
                pending.key_pair,
                pending.options.remote_public_key,
                pending.options.pattern,
                pending.options.psk,
            )?)
        };
        let now = Instant::now();
        Ok(Self {
            shared,
            reader,
            writer,
            content_hint,
            datagrams,
            commands: pending.commands,
            incoming: Some(pending.incoming),
            unordered: pending.unordered,
            phase,
            parser: FrameParser::with_max_frame_size(MAX_NOISE_MESSAGE_SIZE),
            encryptor: None,
            decryptor: None,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            inbox: VecDeque::new(),
            pending_writes: VecDeque::new(),
            outbox: VecDeque::new(),
            flush_waiters: Vec::new(),
            keep_alive: pending.options.keep_alive,
            timeout: pending.options.timeout,
            keep_alive_deadline: now + pending.options.keep_alive,
            timeout_deadline: now + pending.options.timeout,
            read_ended: false,
            end_requested: false,
            write_ended: false,
        })
    }

    async fn run(mut self, start: StartOptions) {
        let result = self.drive(start).await;
        let error = match result {
            Ok(()) => None,
            Err(err) => {
                if !matches!(err, ProtocolError::Destroyed) {
                    tracing::warn!(initiator = self.shared.is_initiator, error = %err, "Secure stream failed");
                }
                Some(err)
            }
        };
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(false);
        }
        self.shared.close(error);
        let _ = self.writer.shutdown().await;
    }

    async fn drive(&mut self, start: StartOptions) -> Result<()> {
        match start.handshake {
            Some(result) => self.on_handshake(result)?,
            None => {
                if let Phase::Handshake(handshake) = &mut self.phase {
                    tracing::debug!(initiator = self.shared.is_initiator, "Starting handshake");
                    let step = handshake.start().map_err(handshake_error)?;
                    if let Some(reply) = step.reply {
                        self.push_raw(Bytes::from(reply));
                    }
                }
            }
        }
        if let Some(data) = start.data {
            self.on_data(data)?;
        }
        if start.ended {
            self.on_read_end()?;
        }

        loop {
            self.settle().await?;
            if self.read_ended && self.write_ended && self.inbox.is_empty() {
                return Ok(());
            }

            if self.read_buf.capacity() - self.read_buf.len() < READ_BUFFER_SIZE / 4 {
                self.read_buf.reserve(READ_BUFFER_SIZE);
            }
            let can_read = !self.read_ended && self.inbox.len() < INBOX_LIMIT;
            let connected = matches!(self.phase, Phase::Connected);
            let keep_alive_on = connected && !self.keep_alive.is_zero() && !self.end_requested;
            let timeout_on = !self.timeout.is_zero();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command)?,
                    // Every handle is gone.
                    None => return Err(ProtocolError::Destroyed),
                },
                read = self.reader.read_buf(&mut self.read_buf), if can_read => match read {
                    Ok(0) => self.on_read_end()?,
                    Ok(n) => {
                        let chunk = self.read_buf.split().freeze();
                        debug_assert_eq!(chunk.len(), n);
                        self.on_data(chunk)?;
                    }
                    Err(err) => return Err(err.into()),
                },
                written = write_some(&mut self.writer, self.outbox.front().map(|o| &o.data)) => {
                    self.on_written(written?);
                }
                permit = reserve(self.incoming.clone()), if !self.inbox.is_empty() => {
                    if let (Ok(permit), Some(message)) = (permit, self.inbox.pop_front()) {
                        permit.send(message);
                    } else {
                        // The receiver is gone; nobody reads anymore.
                        self.inbox.clear();
                    }
                }
                packet = recv_datagram(self.datagrams.as_ref()), if connected => {
                    self.on_datagram(packet);
                }
                _ = sleep_until(self.keep_alive_deadline), if keep_alive_on => {
                    tracing::trace!("Sending keep-alive");
                    self.queue_message(Bytes::new(), 0)?;
                }
                _ = sleep_until(self.timeout_deadline), if timeout_on => {
                    tracing::debug!(timeout = ?self.timeout, "Secure stream timed out");
                    return Err(ProtocolError::Timeout(format!(
                        "no data received for {} ms",
                        self.timeout.as_millis()
                    )));
                }
            }
        }
    }

    /// Completes the bookkeeping that must happen between events.
    async fn settle(&mut self) -> Result<()> {
        if self.read_ended && self.inbox.is_empty() {
            // Dropping the sender ends the handle's `recv`.
            self.incoming = None;
        }
        if !self.outbox.is_empty() {
            return Ok(());
        }
        let connected = matches!(self.phase, Phase::Connected);
        if connected && !self.flush_waiters.is_empty() {
            self.writer.flush().await?;
            for waiter in self.flush_waiters.drain(..) {
                let _ = waiter.send(true);
            }
        }
        if connected && self.end_requested && !self.write_ended {
            self.writer.shutdown().await?;
            self.write_ended = true;
            tracing::debug!(initiator = self.shared.is_initiator, "Write side ended");
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Write(message) => {
                let len = message.len();
                if matches!(self.phase, Phase::Connected) {
                    self.queue_message(message, len)?;
                } else {
                    self.pending_writes.push_back(message);
                }
            }
            Command::Flush(waiter) => self.flush_waiters.push(waiter),
            Command::SetTimeout(timeout) => {
                self.timeout = timeout;
                self.timeout_deadline = Instant::now() + timeout;
            }
            Command::SetKeepAlive(interval) => {
                self.keep_alive = interval;
                self.keep_alive_deadline = Instant::now() + interval;
            }
            Command::End => self.end_requested = true,
            Command::Destroy(error) => return Err(error.unwrap_or(ProtocolError::Destroyed)),
        }
        Ok(())
    }

    fn on_data(&mut self, mut chunk: Bytes) -> Result<()> {
        self.shared
            .raw_bytes_read
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        if !self.timeout.is_zero() {
            self.timeout_deadline = Instant::now() + self.timeout;
        }

        let handshaking = matches!(self.phase, Phase::Handshake(_));
        while let Some(frame) = self.parser.next_frame(&mut chunk).map_err(|err| {
            if handshaking {
                handshake_error(err)
            } else {
                err
            }
        })? {
            self.on_frame(frame)?;
        }

        if let Some(hint) = &self.content_hint {
            hint.set_content_size(self.parser.remaining().unwrap_or(0));
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Bytes) -> Result<()> {
        if let Phase::Handshake(handshake) = &mut self.phase {
            let step = handshake.recv(&frame).map_err(handshake_error)?;
            if let Some(reply) = step.reply {
                self.push_raw(Bytes::from(reply));
            }
            if let Some(result) = step.complete {
                self.on_handshake(result)?;
            }
            return Ok(());
        }
        if matches!(self.phase, Phase::Header) {
            return self.on_header(&frame);
        }

        let decryptor = self
            .decryptor
            .as_mut()
            .ok_or_else(|| ProtocolError::Decryption("no decryptor".into()))?;
        let message = decryptor.decrypt(&frame)?;
        if message.is_empty() && !self.keep_alive.is_zero() {
            return Ok(());
        }
        self.inbox.push_back(Bytes::from(message));
        Ok(())
    }

    fn on_handshake(&mut self, result: HandshakeResult) -> Result<()> {
        *lock(&self.shared.remote_public_key) = result.remote_public_key;
        *lock(&self.shared.handshake_hash) = Some(result.hash);
        tracing::debug!(
            initiator = self.shared.is_initiator,
            remote = ?result.remote_public_key.map(hex::encode),
            "Handshake complete"
        );
        if let Some(observer) = &self.shared.observer {
            observer.on_handshake(&self.shared.info());
        }

        let encryptor = Encryptor::new(&result.tx);
        let header = secretstream::id_header(&result.hash, self.shared.is_initiator, encryptor.header())?;
        self.push_raw(Bytes::from(encode_frame(&header)?));
        self.encryptor = Some(encryptor);
        self.decryptor = Some(Decryptor::new(&result.rx));
        *lock(&self.shared.unordered_box) =
            Some(UnorderedBox::new(&result.hash, self.shared.is_initiator)?);

        self.parser.set_max_frame_size(ID_HEADER_BYTES);
        self.phase = Phase::Header;
        Ok(())
    }

    fn on_header(&mut self, frame: &[u8]) -> Result<()> {
        let hash = (*lock(&self.shared.handshake_hash))
            .ok_or_else(|| ProtocolError::InvalidHeader("header before handshake".into()))?;
        let header = secretstream::verify_id_header(&hash, self.shared.is_initiator, frame)?;
        if let Some(decryptor) = self.decryptor.as_mut() {
            decryptor.init(header);
        }

        self.parser.set_max_frame_size(MAX_FRAME_SIZE);
        self.phase = Phase::Connected;
        self.shared.connected.store(true, Ordering::Release);
        self.shared.status.send_if_modified(|status| {
            if *status == Status::Opening {
                *status = Status::Connected;
                true
            } else {
                false
            }
        });
        tracing::debug!(initiator = self.shared.is_initiator, "Secure stream connected");
        if let Some(observer) = &self.shared.observer {
            observer.on_connect(&self.shared.info());
        }

        while let Some(message) = self.pending_writes.pop_front() {
            let len = message.len();
            self.queue_message(message, len)?;
        }
        Ok(())
    }

    fn on_read_end(&mut self) -> Result<()> {
        if !matches!(self.phase, Phase::Connected) {
            return Err(ProtocolError::ConnectionClosed(
                "stream ended before the handshake completed".into(),
            ));
        }
        if !self.parser.is_idle() {
            return Err(ProtocolError::InvalidFrame("stream ended inside a frame".into()));
        }
        self.read_ended = true;
        tracing::debug!(initiator = self.shared.is_initiator, "Read side ended");
        Ok(())
    }

    fn on_written(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.shared
            .raw_bytes_written
            .fetch_add(n as u64, Ordering::Relaxed);
        let Some(front) = self.outbox.front_mut() else {
            return;
        };
        if n < front.data.len() {
            let _ = front.data.split_to(n);
            return;
        }
        let plaintext = front.plaintext;
        self.outbox.pop_front();
        if plaintext > 0 {
            let before = self.shared.queued.fetch_sub(plaintext, Ordering::AcqRel);
            if before == plaintext {
                self.shared.drain.notify_waiters();
            }
        }
    }

    fn on_datagram(&mut self, packet: Option<Bytes>) {
        let Some(packet) = packet else {
            // Socket closed; stop polling it.
            self.datagrams = None;
            return;
        };
        let opened = match lock(&self.shared.unordered_box).as_ref() {
            Some(unordered) => unordered.open(&packet),
            None => return,
        };
        match opened {
            Ok(message) => {
                if self.unordered.try_send(Bytes::from(message)).is_err() {
                    tracing::trace!("Dropping unordered message, receiver is full");
                }
            }
            Err(err) => tracing::debug!(error = %err, "Dropping invalid unordered packet"),
        }
    }

    /// Queues a handshake or header frame, which does not count as user data.
    fn push_raw(&mut self, frame: Bytes) {
        self.outbox.push_back(Outgoing {
            data: frame,
            plaintext: 0,
        });
    }

    /// Encrypts and queues one message; `accounted` bytes were added to the
    /// queued count by `write`.
    fn queue_message(&mut self, message: Bytes, accounted: usize) -> Result<()> {
        let encryptor = self
            .encryptor
            .as_mut()
            .ok_or(ProtocolError::HandshakeIncomplete)?;
        let len = message.len() + ABYTES;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + len);
        frame.put_slice(&encode_header(len)?);
        frame.put_slice(&message);
        let tag = encryptor.encrypt_in_place(&mut frame[FRAME_HEADER_SIZE..])?;
        frame.put_slice(&tag);

        self.outbox.push_back(Outgoing {
            data: frame.freeze(),
            plaintext: accounted,
        });
        if !self.keep_alive.is_zero() {
            self.keep_alive_deadline = Instant::now() + self.keep_alive;
        }
        Ok(())
    }
}

fn handshake_error(err: ProtocolError) -> ProtocolError {
    match err {
        ProtocolError::HandshakeFailed(_) | ProtocolError::HandshakeTerminated => err,
        other => ProtocolError::HandshakeFailed(other.to_string()),
    }
}

async fn write_some<W: AsyncWrite + Unpin>(writer: &mut W, data: Option<&Bytes>) -> io::Result<usize> {
    match data {
        Some(data) => writer.write(data).await,
        None => std::future::pending().await,
    }
}

async fn reserve(
    sender: Option<mpsc::Sender<Bytes>>,
) -> std::result::Result<mpsc::OwnedPermit<Bytes>, ()> {
    match sender {
        Some(sender) => sender.reserve_owned().await.map_err(|_| ()),
        None => Err(()),
    }
}

async fn recv_datagram(socket: Option<&Arc<dyn DatagramSocket>>) -> Option<Bytes> {
    match socket {
        Some(socket) => socket.recv().await.ok().flatten(),
        None => std::future::pending().await,
    }
}
