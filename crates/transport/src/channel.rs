//! Channels: one sub-protocol session inside a [`Mux`].
//!
//! A channel is created from a [`ChannelBuilder`], registers its message
//! types with [`Channel::add_message`], and is paired with the peer's channel
//! of the same protocol and id once both sides called [`Channel::open`].
//!
//! Every lifecycle and message handler comes in a plain and an `_async`
//! flavour. Futures returned by async handlers are spawned and counted; a
//! closed channel only reports itself destroyed after all of them settled.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use protocol::encoding::{encode_to_bytes, Codec, State};
use protocol::{ProtocolError, Result};
use tokio::sync::watch;

use crate::mux::{CorkGuard, Effect, Mux, MuxInner};

/// Result of invoking a user handler.
pub(crate) enum Outcome {
    Ready(anyhow::Result<()>),
    Pending(BoxFuture<'static, anyhow::Result<()>>),
}

impl Outcome {
    pub(crate) fn pending<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Outcome::Pending(future.boxed())
    }
}

type OpenHandler = Arc<dyn Fn(Option<Bytes>, &Channel) -> Outcome + Send + Sync>;
type CloseHandler = Arc<dyn Fn(bool, &Channel) -> Outcome + Send + Sync>;
type EventHandler = Arc<dyn Fn(&Channel) -> Outcome + Send + Sync>;
type MessageHandler<T> = Arc<dyn Fn(T, &Channel) -> Outcome + Send + Sync>;

/// Maps a handler error to the error the multiplexer is destroyed with.
pub(crate) fn handler_error(err: anyhow::Error) -> ProtocolError {
    match err.downcast::<ProtocolError>() {
        Ok(err) => err,
        Err(err) => ProtocolError::Handler(format!("{err:#}")),
    }
}

#[derive(Default, Clone)]
struct Handlers {
    on_open: Option<OpenHandler>,
    on_close: Option<CloseHandler>,
    on_destroy: Option<EventHandler>,
    on_drain: Option<EventHandler>,
}

/// Options for a new channel.
#[must_use = "a builder does nothing until `create` is called"]
pub struct ChannelBuilder {
    pub(crate) mux: Mux,
    pub(crate) protocol: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) id: Option<Bytes>,
    pub(crate) unique: bool,
    pub(crate) handshake: bool,
    handlers: Handlers,
}

impl fmt::Debug for ChannelBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBuilder")
            .field("protocol", &self.protocol)
            .field("aliases", &self.aliases)
            .field("id", &self.id.as_ref().map(hex::encode))
            .field("unique", &self.unique)
            .field("handshake", &self.handshake)
            .finish_non_exhaustive()
    }
}

impl ChannelBuilder {
    pub(crate) fn new(mux: Mux, protocol: String) -> Self {
        Self {
            mux,
            protocol,
            aliases: Vec::new(),
            id: None,
            unique: true,
            handshake: false,
            handlers: Handlers::default(),
        }
    }

    /// Distinguishes channels of the same protocol. An empty id is no id.
    pub fn id(mut self, id: impl Into<Bytes>) -> Self {
        let id = id.into();
        self.id = (!id.is_empty()).then_some(id);
        self
    }

    /// Also pairs with remote opens for `alias`.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Whether creation fails while another channel of the same protocol
    /// and id is open. Defaults to true.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Declares that open messages carry a raw handshake payload.
    pub fn handshake(mut self, declared: bool) -> Self {
        self.handshake = declared;
        self
    }

    /// Called once paired, with the peer's handshake payload.
    pub fn on_open<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<Bytes>, &Channel) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.on_open = Some(Arc::new(move |hs: Option<Bytes>, ch: &Channel| {
            Outcome::Ready(handler(hs, ch))
        }));
        self
    }

    pub fn on_open_async<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Option<Bytes>, &Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.on_open = Some(Arc::new(move |hs: Option<Bytes>, ch: &Channel| {
            Outcome::pending(handler(hs, ch))
        }));
        self
    }

    /// Called once closed; the flag tells whether the peer closed it.
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: Fn(bool, &Channel) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.on_close = Some(Arc::new(move |remote: bool, ch: &Channel| {
            Outcome::Ready(handler(remote, ch))
        }));
        self
    }

    pub fn on_close_async<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(bool, &Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.on_close = Some(Arc::new(move |remote: bool, ch: &Channel| {
            Outcome::pending(handler(remote, ch))
        }));
        self
    }

    /// Called once closed and every tracked handler settled.
    pub fn on_destroy<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Channel) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.on_destroy = Some(Arc::new(move |ch: &Channel| Outcome::Ready(handler(ch))));
        self
    }

    pub fn on_destroy_async<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(&Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.on_destroy = Some(Arc::new(move |ch: &Channel| {
            Outcome::pending(handler(ch))
        }));
        self
    }

    /// Called when the underlying stream drained after backpressure.
    pub fn on_drain<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Channel) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.on_drain = Some(Arc::new(move |ch: &Channel| Outcome::Ready(handler(ch))));
        self
    }

    pub fn on_drain_async<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(&Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers.on_drain = Some(Arc::new(move |ch: &Channel| Outcome::pending(handler(ch))));
        self
    }

    /// Creates the channel.
    ///
    /// Returns `None` when the multiplexer is gone, or when the channel is
    /// unique and one with the same protocol and id is already open.
    pub fn create(self) -> Option<Channel> {
        let mux = self.mux.inner.clone();
        mux.create_channel(self)
    }

    pub(crate) fn build(self, mux: Weak<MuxInner>) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                mux,
                protocol: self.protocol,
                aliases: self.aliases,
                id: self.id,
                declares_handshake: self.handshake,
                handlers: self.handlers,
                messages: Mutex::new(Vec::new()),
                state: Mutex::new(ChannelState::default()),
                status: watch::channel(Status::default()).0,
            }),
        }
    }
}

/// Decodes and handles one registered message type.
trait MessageSlot: Send + Sync {
    fn recv(&self, payload: Bytes, channel: &Channel) -> Result<Outcome>;
}

struct Registered<C: Codec> {
    codec: Arc<C>,
    handler: MessageHandler<C::Value>,
}

impl<C: Codec> MessageSlot for Registered<C> {
    fn recv(&self, payload: Bytes, channel: &Channel) -> Result<Outcome> {
        // Trailing bytes are left for newer peers that extend a message.
        let value = self.codec.decode(&mut State::new(payload))?;
        Ok((self.handler)(value, channel))
    }
}

/// Mutable channel state, guarded by the multiplexer's lock order:
/// multiplexer state first, then this.
#[derive(Debug, Default)]
pub(crate) struct ChannelState {
    pub(crate) local_id: u64,
    pub(crate) remote_id: u64,
    pub(crate) opened: bool,
    pub(crate) closed: bool,
    pub(crate) destroyed: bool,
    pub(crate) active: usize,
    pub(crate) handshake: Option<Bytes>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Status {
    opened: bool,
    closed: bool,
    destroyed: bool,
}

pub(crate) struct ChannelInner {
    mux: Weak<MuxInner>,
    pub(crate) protocol: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) id: Option<Bytes>,
    pub(crate) declares_handshake: bool,
    handlers: Handlers,
    messages: Mutex<Vec<Option<Arc<dyn MessageSlot>>>>,
    state: Mutex<ChannelState>,
    status: watch::Sender<Status>,
}

/// Handle to a channel. Clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Channel")
            .field("protocol", &self.inner.protocol)
            .field("id", &self.inner.id.as_ref().map(hex::encode))
            .field("local_id", &state.local_id)
            .field("remote_id", &state.remote_id)
            .field("opened", &state.opened)
            .field("closed", &state.closed)
            .finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Channel {}

impl Channel {
    pub(crate) fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn key(&self) -> (String, Option<Bytes>) {
        (self.inner.protocol.clone(), self.inner.id.clone())
    }

    fn mux_inner(&self) -> Result<Arc<MuxInner>> {
        self.inner.mux.upgrade().ok_or(ProtocolError::Destroyed)
    }

    /// The multiplexer this channel belongs to, if it still exists.
    pub fn mux(&self) -> Option<Mux> {
        self.inner.mux.upgrade().map(|inner| Mux { inner })
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn id(&self) -> Option<&Bytes> {
        self.inner.id.as_ref()
    }

    pub fn aliases(&self) -> &[String] {
        &self.inner.aliases
    }

    /// The peer's handshake payload once opened, if the channel declares one.
    pub fn handshake(&self) -> Option<Bytes> {
        self.state().handshake.clone()
    }

    /// Our id for this channel on the wire, while open.
    pub fn local_id(&self) -> Option<u64> {
        let id = self.state().local_id;
        (id != 0).then_some(id)
    }

    /// The peer's id for this channel, once known.
    pub fn remote_id(&self) -> Option<u64> {
        let id = self.state().remote_id;
        (id != 0).then_some(id)
    }

    pub fn is_opened(&self) -> bool {
        self.state().opened
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    /// Registers the next message type.
    ///
    /// Types are numbered in registration order, and both peers must
    /// register them in the same order.
    pub fn add_message<C, F>(&self, codec: C, handler: F) -> Message<C>
    where
        C: Codec,
        F: Fn(C::Value, &Channel) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(codec, Arc::new(move |value: C::Value, ch: &Channel| {
            Outcome::Ready(handler(value, ch))
        }))
    }

    /// Registers the next message type with an async handler.
    pub fn add_message_async<C, F, Fut>(&self, codec: C, handler: F) -> Message<C>
    where
        C: Codec,
        F: Fn(C::Value, &Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(codec, Arc::new(move |value: C::Value, ch: &Channel| {
            Outcome::pending(handler(value, ch))
        }))
    }

    /// Reserves the next message type without handling it.
    pub fn skip_message(&self) -> u64 {
        let mut messages = self.messages();
        messages.push(None);
        messages.len() as u64 - 1
    }

    fn register<C: Codec>(&self, codec: C, handler: MessageHandler<C::Value>) -> Message<C> {
        let codec = Arc::new(codec);
        let mut messages = self.messages();
        let message_type = messages.len() as u64;
        messages.push(Some(Arc::new(Registered {
            codec: codec.clone(),
            handler,
        })));
        Message {
            channel: self.clone(),
            message_type,
            codec,
        }
    }

    fn messages(&self) -> MutexGuard<'_, Vec<Option<Arc<dyn MessageSlot>>>> {
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Announces the channel to the peer, with our handshake payload if the
    /// channel declares one.
    pub fn open(&self, handshake: Option<Bytes>) -> Result<()> {
        self.mux_inner()?.open_channel(self, handshake)
    }

    /// Closes the channel. Idempotent.
    pub fn close(&self) {
        if let Some(mux) = self.inner.mux.upgrade() {
            mux.close_channel(self);
        }
    }

    /// Resolves true once paired, false if closed first.
    pub async fn fully_opened(&self) -> bool {
        let mut status = self.inner.status.subscribe();
        let opened = match status.wait_for(|s| s.opened || s.closed).await {
            Ok(status) => status.opened,
            Err(_) => false,
        };
        opened
    }

    /// Resolves once the channel is destroyed.
    pub async fn fully_closed(&self) {
        let mut status = self.inner.status.subscribe();
        let _ = status.wait_for(|s| s.destroyed).await;
    }

    /// Starts batching writes on the whole multiplexer.
    pub fn cork(&self) {
        if let Some(mux) = self.inner.mux.upgrade() {
            mux.cork();
        }
    }

    /// Flushes batched writes once every cork was released.
    pub fn uncork(&self) {
        if let Some(mux) = self.inner.mux.upgrade() {
            mux.uncork();
        }
    }

    /// Resolves once the underlying stream drained.
    pub async fn drained(&self) -> bool {
        match self.inner.mux.upgrade() {
            Some(mux) => mux.stream_drained().await,
            None => false,
        }
    }

    pub(crate) fn send_raw(&self, message_type: u64, payload: Bytes) -> Result<bool> {
        self.mux_inner()?.send_message(self, message_type, payload)
    }

    pub(crate) fn mark_opened(&self) {
        self.inner.status.send_modify(|s| s.opened = true);
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.status.send_modify(|s| s.closed = true);
    }

    // Handler invocation, only ever called by the multiplexer's dispatcher.

    pub(crate) fn call_open(&self, handshake: Option<Bytes>) -> Option<Outcome> {
        let handler = self.inner.handlers.on_open.clone()?;
        Some(handler(handshake, self))
    }

    pub(crate) fn call_close(&self, is_remote: bool) -> Option<Outcome> {
        let handler = self.inner.handlers.on_close.clone()?;
        Some(handler(is_remote, self))
    }

    pub(crate) fn call_drain(&self) -> Option<Outcome> {
        let handler = self.inner.handlers.on_drain.clone()?;
        Some(handler(self))
    }

    /// Marks the channel destroyed and runs its destroy handler, once.
    pub(crate) fn call_destroy(&self) -> Option<Outcome> {
        {
            let mut state = self.state();
            if state.destroyed {
                return None;
            }
            state.destroyed = true;
        }
        tracing::trace!(protocol = %self.inner.protocol, "Channel destroyed");
        let outcome = self
            .inner
            .handlers
            .on_destroy
            .clone()
            .map(|handler| handler(self));
        self.inner.status.send_modify(|s| s.destroyed = true);
        outcome
    }

    /// Decodes and handles a message. Unknown and skipped types are ignored.
    pub(crate) fn call_message(&self, message_type: u64, payload: Bytes) -> Result<Option<Outcome>> {
        let slot = usize::try_from(message_type)
            .ok()
            .and_then(|index| self.messages().get(index).cloned().flatten());
        match slot {
            Some(slot) => slot.recv(payload, self).map(Some),
            None => Ok(None),
        }
    }

    /// Whether the channel is closed with no handler in flight.
    pub(crate) fn is_settled(&self) -> bool {
        let state = self.state();
        state.closed && state.active == 0 && !state.destroyed
    }

    /// Tracks a handler outcome; failures destroy the multiplexer.
    pub(crate) fn track(&self, outcome: Option<Outcome>, guard: Option<Arc<CorkGuard>>) {
        match outcome {
            None | Some(Outcome::Ready(Ok(()))) => {}
            Some(Outcome::Ready(Err(err))) => self.fail(err),
            Some(Outcome::Pending(future)) => {
                self.state().active += 1;
                let channel = self.clone();
                tokio::spawn(async move {
                    let result = future.await;
                    drop(guard);
                    channel.settle(result);
                });
            }
        }
    }

    fn settle(&self, result: anyhow::Result<()>) {
        let settled = {
            let mut state = self.state();
            state.active = state.active.saturating_sub(1);
            state.active == 0 && state.closed && !state.destroyed
        };
        if settled {
            if let Some(mux) = self.inner.mux.upgrade() {
                mux.schedule(Effect::Destroy(self.clone()));
            }
        }
        if let Err(err) = result {
            self.fail(err);
        }
    }

    fn fail(&self, err: anyhow::Error) {
        let err = handler_error(err);
        tracing::warn!(protocol = %self.inner.protocol, error = %err, "Channel handler failed");
        if let Some(mux) = self.inner.mux.upgrade() {
            mux.destroy(err);
        }
    }
}

/// Sender for one registered message type.
pub struct Message<C: Codec> {
    channel: Channel,
    message_type: u64,
    codec: Arc<C>,
}

impl<C: Codec> Clone for Message<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            message_type: self.message_type,
            codec: self.codec.clone(),
        }
    }
}

impl<C: Codec> fmt::Debug for Message<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("protocol", &self.channel.inner.protocol)
            .field("message_type", &self.message_type)
            .finish()
    }
}

impl<C: Codec> Message<C> {
    /// Ordinal of this message type on the wire.
    pub fn message_type(&self) -> u64 {
        self.message_type
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Sends a message.
    ///
    /// Returns `Ok(false)` when the channel is closed or the stream asks for
    /// backpressure.
    pub fn send(&self, value: &C::Value) -> Result<bool> {
        let payload = encode_to_bytes(self.codec.as_ref(), value)?;
        self.channel.send_raw(self.message_type, payload)
    }
}
