//! Channel multiplexer over a message stream.
//!
//! All state lives behind one lock. Work that calls back into user code
//! (open, message, close, destroy and drain handlers, pairing requests) is
//! queued as an [`Effect`] while the lock is held and run afterwards by a
//! single dispatcher, so handlers observe events in wire order and may call
//! back into the multiplexer freely.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use protocol::control::{
    close_body, decode_body, decode_frame, encode_frame, open_body, reject_body,
};
use protocol::{BatchEncoder, ControlMessage, Frame, OpenMessage, ProtocolError, Result, CONTROL_CHANNEL};
use tokio::sync::{watch, Notify};

use crate::channel::{handler_error, Channel, ChannelBuilder, Outcome};
use crate::config::MuxConfig;
use crate::message_stream::MessageStream;

/// Bytes of unpaired-channel messages buffered before reading pauses.
pub const MAX_BUFFERED: usize = 32 * 1024;

/// Batch size after which a corked batch is flushed early.
pub const MAX_BATCH: usize = 8 * 1024 * 1024;

/// Fixed cost charged per buffered message on top of its length.
const BUFFERED_OVERHEAD: usize = 512;

type PairHandler = Arc<dyn Fn(&Mux, Option<Bytes>) -> Outcome + Send + Sync>;

type Key = (String, Option<Bytes>);

fn key(protocol: &str, id: Option<&[u8]>) -> Key {
    (
        protocol.to_string(),
        id.filter(|id| !id.is_empty()).map(Bytes::copy_from_slice),
    )
}

fn buffered_size(payload: &Bytes) -> usize {
    BUFFERED_OVERHEAD + payload.len()
}

/// Multiplexer limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxOptions {
    /// Byte budget for messages to channels that are not paired yet.
    pub max_buffered: usize,
    /// Corked batch size that triggers an early flush.
    pub max_batch: usize,
    /// Unanswered remote opens tolerated; `None` is unlimited.
    pub max_backlog: Option<usize>,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            max_buffered: MAX_BUFFERED,
            max_batch: MAX_BATCH,
            max_backlog: None,
        }
    }
}

impl MuxOptions {
    /// Builds options from the `[mux]` configuration section.
    pub fn from_config(config: &MuxConfig) -> Self {
        Self {
            max_buffered: config.max_buffered,
            max_batch: config.max_batch,
            max_backlog: config.max_backlog,
        }
    }
}

/// Deferred call into user code.
pub(crate) enum Effect {
    Open {
        channel: Channel,
        handshake: Option<Bytes>,
        guard: Option<Arc<CorkGuard>>,
    },
    Message {
        channel: Channel,
        message_type: u64,
        payload: Bytes,
        guard: Option<Arc<CorkGuard>>,
    },
    Close {
        channel: Channel,
        is_remote: bool,
    },
    Destroy(Channel),
    Drain(Channel),
    /// A remote open nobody was waiting for.
    Request {
        protocol: String,
        id: Option<Bytes>,
        guard: Option<Arc<CorkGuard>>,
    },
}

/// Uncorks the multiplexer when the last clone is dropped.
///
/// Handlers spawned while processing an incoming batch hold a clone, so
/// their replies leave as one batch.
pub(crate) struct CorkGuard(Weak<MuxInner>);

impl Drop for CorkGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.0.upgrade() {
            inner.uncork();
        }
    }
}

/// A message for a remote channel that no local channel claimed yet.
struct Pending {
    message_type: u64,
    payload: Bytes,
}

/// A channel the peer opened.
struct Remote {
    /// Handshake bytes from the open message until pairing consumes them.
    handshake: Option<Bytes>,
    /// Buffered messages while unpaired; `None` once paired.
    pending: Option<Vec<Pending>>,
    session: Option<Channel>,
}

/// Pairing bookkeeping for one protocol and id, shared by its aliases.
#[derive(Default)]
struct Info {
    keys: Vec<Key>,
    /// Pairing requests whose handler has not settled.
    pairing: usize,
    /// Open local channels.
    opened: usize,
    /// Remote ids waiting for a local channel.
    incoming: VecDeque<u64>,
    /// Local ids waiting for the peer's open.
    outgoing: VecDeque<u64>,
    last_channel: Option<Channel>,
}

#[derive(Default)]
struct MuxState {
    local: Vec<Option<Channel>>,
    remote: Vec<Option<Remote>>,
    free: Vec<usize>,
    infos: HashMap<u64, Info>,
    keys: HashMap<Key, u64>,
    next_info: u64,
    notify: HashMap<Key, PairHandler>,
    remote_backlog: usize,
    buffered: usize,
    paused: bool,
    corked: usize,
    batch: Option<BatchEncoder>,
    drained: bool,
    draining: bool,
    destroyed: bool,
    error: Option<ProtocolError>,
    effects: VecDeque<Effect>,
    dispatching: bool,
}

impl MuxState {
    /// Finds or creates the pairing info shared by `protocol` and its
    /// aliases under `id`.
    fn info_for(&mut self, protocol: &str, id: Option<&Bytes>, aliases: &[String]) -> u64 {
        let keys: Vec<Key> = std::iter::once(protocol)
            .chain(aliases.iter().map(String::as_str))
            .map(|name| (name.to_string(), id.cloned()))
            .collect();
        let info_id = match keys.iter().find_map(|key| self.keys.get(key).copied()) {
            Some(info_id) => info_id,
            None => {
                let info_id = self.next_info;
                self.next_info += 1;
                self.infos.insert(info_id, Info::default());
                info_id
            }
        };
        for key in keys {
            if self.keys.contains_key(&key) {
                continue;
            }
            self.keys.insert(key.clone(), info_id);
            if let Some(info) = self.infos.get_mut(&info_id) {
                info.keys.push(key);
            }
        }
        info_id
    }

    fn info_of(&self, key: &Key) -> Option<u64> {
        self.keys.get(key).copied()
    }

    /// Forgets pairing state nobody refers to anymore.
    fn gc(&mut self, info_id: u64) {
        let idle = self.infos.get(&info_id).map_or(false, |info| {
            info.opened == 0 && info.pairing == 0 && info.incoming.is_empty() && info.outgoing.is_empty()
        });
        if !idle {
            return;
        }
        if let Some(info) = self.infos.remove(&info_id) {
            for key in info.keys {
                if self.keys.get(&key) == Some(&info_id) {
                    self.keys.remove(&key);
                }
            }
        }
    }

    fn remote_mut(&mut self, remote_id: u64) -> Option<&mut Remote> {
        let index = usize::try_from(remote_id.checked_sub(1)?).ok()?;
        self.remote.get_mut(index)?.as_mut()
    }

    fn local_channel(&self, local_id: u64) -> Option<Channel> {
        let index = usize::try_from(local_id.checked_sub(1)?).ok()?;
        self.local.get(index)?.clone()
    }
}

pub(crate) struct MuxInner {
    stream: Arc<dyn MessageStream>,
    options: MuxOptions,
    state: Mutex<MuxState>,
    resume: Notify,
    closed: watch::Sender<bool>,
}

/// Multiplexes channels over one message stream.
///
/// Clones share the same multiplexer. It lives as long as its stream.
#[derive(Clone)]
pub struct Mux {
    pub(crate) inner: Arc<MuxInner>,
}

impl fmt::Debug for Mux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Mux")
            .field("channels", &state.local.iter().flatten().count())
            .field("buffered", &state.buffered)
            .field("paused", &state.paused)
            .field("corked", &state.corked)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

impl Mux {
    /// Multiplexes `stream` with default limits.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S: MessageStream>(stream: S) -> Self {
        Self::with_options(stream, MuxOptions::default())
    }

    pub fn with_options<S: MessageStream>(stream: S, options: MuxOptions) -> Self {
        let inner = Arc::new(MuxInner {
            stream: Arc::new(stream),
            options,
            state: Mutex::new(MuxState {
                drained: true,
                ..Default::default()
            }),
            resume: Notify::new(),
            closed: watch::channel(false).0,
        });
        tokio::spawn(MuxInner::run(inner.clone()));
        Self { inner }
    }

    /// Starts building a channel for `protocol`.
    pub fn channel(&self, protocol: impl Into<String>) -> ChannelBuilder {
        ChannelBuilder::new(self.clone(), protocol.into())
    }

    /// Calls `handler` when the peer opens `protocol` and `id` before we
    /// did. A handler registered without an id catches every id.
    ///
    /// If no matching channel was created once the handler returns, the
    /// peer's open is rejected.
    pub fn pair<F>(&self, protocol: &str, id: Option<&[u8]>, handler: F)
    where
        F: Fn(&Mux, Option<Bytes>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: PairHandler =
            Arc::new(move |mux: &Mux, id: Option<Bytes>| Outcome::Ready(handler(mux, id)));
        self.inner.lock().notify.insert(key(protocol, id), handler);
    }

    /// Like [`pair`](Self::pair), rejecting once the returned future settles.
    pub fn pair_async<F, Fut>(&self, protocol: &str, id: Option<&[u8]>, handler: F)
    where
        F: Fn(&Mux, Option<Bytes>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: PairHandler =
            Arc::new(move |mux: &Mux, id: Option<Bytes>| Outcome::pending(handler(mux, id)));
        self.inner.lock().notify.insert(key(protocol, id), handler);
    }

    pub fn unpair(&self, protocol: &str, id: Option<&[u8]>) {
        self.inner.lock().notify.remove(&key(protocol, id));
    }

    /// Whether a local channel for `protocol` and `id` is open.
    pub fn opened(&self, protocol: &str, id: Option<&[u8]>) -> bool {
        let state = self.inner.lock();
        state
            .info_of(&key(protocol, id))
            .and_then(|info| state.infos.get(&info))
            .map_or(false, |info| info.opened > 0)
    }

    /// The most recently opened channel for `protocol` and `id`.
    pub fn get_last_channel(&self, protocol: &str, id: Option<&[u8]>) -> Option<Channel> {
        let state = self.inner.lock();
        let info = state.info_of(&key(protocol, id))?;
        state.infos.get(&info)?.last_channel.clone()
    }

    /// Whether every local id is free.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock();
        state.local.len() == state.free.len()
    }

    /// Open local channels, by local id.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.lock().local.iter().flatten().cloned().collect()
    }

    /// Batches writes until the matching [`uncork`](Self::uncork).
    pub fn cork(&self) {
        self.inner.cork();
    }

    pub fn uncork(&self) {
        self.inner.uncork();
    }

    /// Whether the last write was accepted without backpressure.
    pub fn is_drained(&self) -> bool {
        self.inner.lock().drained
    }

    /// Resolves once the stream drained; false if it closed first.
    pub async fn drained(&self) -> bool {
        self.inner.stream_drained().await
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// The error the multiplexer shut down with, if any.
    pub fn error(&self) -> Option<ProtocolError> {
        self.inner.lock().error.clone()
    }

    /// Resolves once shut down, with the error that caused it.
    pub async fn closed(&self) -> Result<()> {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Destroys the underlying stream, closing every channel.
    pub fn destroy(&self, error: Option<ProtocolError>) {
        self.inner.stream.destroy(error);
    }
}

impl MuxInner {
    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run(self: Arc<Self>) {
        let result = self.read_loop().await;
        self.shutdown(result.err());
    }

    async fn read_loop(self: &Arc<Self>) -> Result<()> {
        loop {
            let paused = self.lock().paused;
            if paused {
                tokio::select! {
                    _ = self.resume.notified() => continue,
                    result = self.stream.closed() => return result,
                }
            }

            match self.stream.recv().await? {
                Some(frame) => self.on_frame(frame),
                None => {
                    tracing::debug!("Remote ended, ending multiplexed stream");
                    self.stream.end();
                    return self.stream.closed().await;
                }
            }
        }
    }

    fn shutdown(self: &Arc<Self>, error: Option<ProtocolError>) {
        {
            let mut state = self.lock();
            state.destroyed = true;
            if state.error.is_none() {
                state.error = error.clone();
            }
            let mut channels: Vec<Channel> = state.local.iter().flatten().cloned().collect();
            // Claimed from a remote open but never opened locally.
            for remote in state.remote.iter().flatten() {
                if let Some(session) = &remote.session {
                    if !channels.contains(session) {
                        channels.push(session.clone());
                    }
                }
            }
            for channel in &channels {
                self.close_in(&mut state, channel, true);
            }
        }
        match &error {
            Some(err) => tracing::debug!(error = %err, "Multiplexer destroyed"),
            None => tracing::debug!("Multiplexer closed"),
        }
        self.closed.send_replace(true);
        self.dispatch();
    }

    pub(crate) fn destroy(&self, error: ProtocolError) {
        self.stream.destroy(Some(error));
    }

    pub(crate) async fn stream_drained(&self) -> bool {
        self.stream.drained().await
    }

    /// Queues an effect and runs the dispatcher.
    pub(crate) fn schedule(self: &Arc<Self>, effect: Effect) {
        self.lock().effects.push_back(effect);
        self.dispatch();
    }

    /// Runs queued effects unless another caller is already doing so.
    fn dispatch(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.dispatching {
                return;
            }
            state.dispatching = true;
        }
        let _reset = DispatchReset(self);
        loop {
            let effect = {
                let mut state = self.lock();
                match state.effects.pop_front() {
                    Some(effect) => effect,
                    None => {
                        state.dispatching = false;
                        return;
                    }
                }
            };
            self.run_effect(effect);
        }
    }

    fn run_effect(self: &Arc<Self>, effect: Effect) {
        match effect {
            Effect::Open {
                channel,
                handshake,
                guard,
            } => {
                let outcome = channel.call_open(handshake);
                channel.track(outcome, guard);
            }
            Effect::Message {
                channel,
                message_type,
                payload,
                guard,
            } => match channel.call_message(message_type, payload) {
                Ok(outcome) => channel.track(outcome, guard),
                Err(err) => {
                    tracing::warn!(
                        protocol = %channel.protocol(),
                        message_type,
                        error = %err,
                        "Undecodable channel message"
                    );
                    self.destroy(err);
                }
            },
            Effect::Close { channel, is_remote } => {
                let outcome = channel.call_close(is_remote);
                channel.track(outcome, None);
                if channel.is_settled() {
                    let outcome = channel.call_destroy();
                    channel.track(outcome, None);
                }
            }
            Effect::Destroy(channel) => {
                let outcome = channel.call_destroy();
                channel.track(outcome, None);
            }
            Effect::Drain(channel) => {
                let outcome = channel.call_drain();
                channel.track(outcome, None);
            }
            Effect::Request {
                protocol,
                id,
                guard,
            } => self.request(protocol, id, guard),
        }
    }

    /// Offers an unmatched remote open to the pair handler.
    fn request(self: &Arc<Self>, protocol: String, id: Option<Bytes>, guard: Option<Arc<CorkGuard>>) {
        let handler = {
            let state = self.lock();
            state
                .notify
                .get(&(protocol.clone(), id.clone()))
                .or_else(|| state.notify.get(&(protocol.clone(), None)))
                .cloned()
        };
        let Some(handler) = handler else {
            self.finish_request(&protocol, id);
            return;
        };

        let mux = Mux { inner: self.clone() };
        match handler(&mux, id.clone()) {
            Outcome::Ready(result) => {
                self.finish_request(&protocol, id);
                if let Err(err) = result {
                    self.destroy(handler_error(err));
                }
            }
            Outcome::Pending(future) => {
                let inner = self.clone();
                tokio::spawn(async move {
                    let result = future.await;
                    inner.finish_request(&protocol, id);
                    drop(guard);
                    if let Err(err) = result {
                        inner.destroy(handler_error(err));
                    }
                });
            }
        }
    }

    /// Rejects remote opens still unclaimed once no request is in flight.
    fn finish_request(self: &Arc<Self>, protocol: &str, id: Option<Bytes>) {
        let mut state = self.lock();
        let Some(info_id) = state.info_of(&(protocol.to_string(), id)) else {
            return;
        };
        let unclaimed: Vec<u64> = match state.infos.get_mut(&info_id) {
            Some(info) => {
                info.pairing = info.pairing.saturating_sub(1);
                if info.pairing > 0 {
                    return;
                }
                info.incoming.drain(..).collect()
            }
            None => return,
        };
        for remote_id in unclaimed {
            state.remote_backlog = state.remote_backlog.saturating_sub(1);
            tracing::debug!(protocol, remote_id, "Rejecting unclaimed channel");
            if let Err(err) = self.reject_remote(&mut state, remote_id) {
                tracing::debug!(error = %err, "Failed to send reject");
            }
        }
        state.gc(info_id);
    }

    fn on_frame(self: &Arc<Self>, frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        let mut guards = Vec::new();
        let result = decode_frame(frame).and_then(|frame| {
            let mut state = self.lock();
            self.handle_frame(&mut state, frame, None, &mut guards)
        });
        // Guards uncork on drop, which needs the lock.
        drop(guards);
        if let Err(err) = result {
            tracing::warn!(error = %err, "Invalid multiplexer frame");
            self.destroy(err);
        }
        self.dispatch();
    }

    fn handle_frame(
        self: &Arc<Self>,
        state: &mut MuxState,
        frame: Frame,
        guard: Option<&Arc<CorkGuard>>,
        guards: &mut Vec<Arc<CorkGuard>>,
    ) -> Result<()> {
        match frame {
            Frame::Message {
                channel,
                message_type,
                payload,
            } => {
                self.on_message(state, channel, message_type, payload, guard);
                Ok(())
            }
            Frame::Control(ControlMessage::Batch(entries)) => {
                // Replies to a multi-message batch go out as one batch.
                let batch_guard = if entries.len() > 1 {
                    self.cork_in(state);
                    let batch_guard = Arc::new(CorkGuard(Arc::downgrade(self)));
                    guards.push(batch_guard.clone());
                    Some(batch_guard)
                } else {
                    None
                };
                let guard = batch_guard.as_ref().or(guard);
                for (channel, body) in entries {
                    let frame = decode_body(channel, body)?;
                    if matches!(frame, Frame::Control(ControlMessage::Batch(_))) {
                        return Err(ProtocolError::InvalidControl("batch inside a batch".into()));
                    }
                    self.handle_frame(state, frame, guard, guards)?;
                }
                Ok(())
            }
            Frame::Control(ControlMessage::Open(open)) => self.on_open(state, open, guard),
            Frame::Control(ControlMessage::Reject(id)) => self.on_reject(state, id),
            Frame::Control(ControlMessage::Close(id)) => {
                self.on_close(state, id);
                Ok(())
            }
            Frame::Control(ControlMessage::Unknown(kind)) => {
                tracing::trace!(kind, "Ignoring unknown control message");
                Ok(())
            }
        }
    }

    fn on_message(
        &self,
        state: &mut MuxState,
        remote_id: u64,
        message_type: u64,
        payload: Bytes,
        guard: Option<&Arc<CorkGuard>>,
    ) {
        let Some(remote) = state.remote_mut(remote_id) else {
            // Closed channel; the message was already in flight.
            return;
        };
        if let Some(pending) = remote.pending.as_mut() {
            let size = buffered_size(&payload);
            pending.push(Pending {
                message_type,
                payload,
            });
            state.buffered += size;
            self.pause_maybe(state);
            return;
        }
        if let Some(channel) = remote.session.clone() {
            state.effects.push_back(Effect::Message {
                channel,
                message_type,
                payload,
                guard: guard.cloned(),
            });
        }
    }

    fn on_open(
        self: &Arc<Self>,
        state: &mut MuxState,
        open: OpenMessage,
        guard: Option<&Arc<CorkGuard>>,
    ) -> Result<()> {
        if open.id == 0 {
            // Opening the control channel is not allowed.
            self.write_in(state, CONTROL_CHANNEL, reject_body(0))?;
            return Ok(());
        }
        let index = usize::try_from(open.id - 1)
            .map_err(|_| ProtocolError::InvalidControl(format!("open for id {}", open.id)))?;

        // The peer may grow its ids by one at a time.
        if index == state.remote.len() {
            state.remote.push(None);
        }
        if index >= state.remote.len() || state.remote[index].is_some() {
            return Err(ProtocolError::InvalidControl(format!(
                "open for id {} that is in use or out of range",
                open.id
            )));
        }

        tracing::trace!(protocol = %open.protocol, remote_id = open.id, "Remote opened channel");
        let info_id = state.info_for(&open.protocol, open.protocol_id.as_ref(), &[]);
        let outgoing = state
            .infos
            .get_mut(&info_id)
            .and_then(|info| info.outgoing.pop_front());

        if let Some(local_id) = outgoing {
            let Some(channel) = state.local_channel(local_id) else {
                // We closed it before the peer answered; the id is free now.
                state.free.push((local_id - 1) as usize);
                state.gc(info_id);
                return Ok(());
            };
            state.remote[index] = Some(Remote {
                handshake: Some(open.handshake),
                pending: None,
                session: None,
            });
            channel.state().remote_id = open.id;
            self.fully_open(state, &channel, guard);
            return Ok(());
        }

        state.remote[index] = Some(Remote {
            handshake: Some(open.handshake),
            pending: Some(Vec::new()),
            session: None,
        });
        state.remote_backlog += 1;
        if let Some(max) = self.options.max_backlog {
            if state.remote_backlog > max {
                return Err(ProtocolError::InvalidControl(format!(
                    "remote exceeded backlog of {max} unanswered opens"
                )));
            }
        }
        if let Some(info) = state.infos.get_mut(&info_id) {
            info.pairing += 1;
            info.incoming.push_back(open.id);
        }
        state.effects.push_back(Effect::Request {
            protocol: open.protocol,
            id: open.protocol_id,
            guard: guard.cloned(),
        });
        Ok(())
    }

    fn on_reject(self: &Arc<Self>, state: &mut MuxState, local_id: u64) -> Result<()> {
        let info_id = state
            .infos
            .iter()
            .find(|(_, info)| info.outgoing.contains(&local_id))
            .map(|(id, _)| *id);
        let Some(info_id) = info_id else {
            // Already paired under an alias the peer does not speak.
            tracing::trace!(local_id, "Ignoring reject for unknown channel");
            return Ok(());
        };

        if let Some(info) = state.infos.get_mut(&info_id) {
            info.outgoing.retain(|id| *id != local_id);
        }
        tracing::debug!(local_id, "Remote rejected channel");
        state.free.push((local_id - 1) as usize);
        if let Some(channel) = state.local_channel(local_id) {
            self.close_in(state, &channel, true);
        }
        state.gc(info_id);
        Ok(())
    }

    fn on_close(self: &Arc<Self>, state: &mut MuxState, remote_id: u64) {
        let session = match state.remote_mut(remote_id) {
            Some(remote) => remote.session.clone(),
            None => return,
        };
        match session {
            Some(channel) => self.close_in(state, &channel, true),
            None => {
                // Withdrawn before any local channel claimed it.
                let info_id = state
                    .infos
                    .iter()
                    .find(|(_, info)| info.incoming.contains(&remote_id))
                    .map(|(id, _)| *id);
                if let Some(info_id) = info_id {
                    if let Some(info) = state.infos.get_mut(&info_id) {
                        info.incoming.retain(|id| *id != remote_id);
                    }
                    state.remote_backlog = state.remote_backlog.saturating_sub(1);
                    state.gc(info_id);
                }
                self.clear_remote(state, remote_id);
            }
        }
    }

    pub(crate) fn create_channel(self: &Arc<Self>, builder: ChannelBuilder) -> Option<Channel> {
        let mut state = self.lock();
        if state.destroyed || self.stream.is_destroyed() {
            return None;
        }
        let info_id = state.info_for(&builder.protocol, builder.id.as_ref(), &builder.aliases);
        let info = state.infos.get_mut(&info_id)?;
        if builder.unique && info.opened > 0 {
            return None;
        }
        let remote_id = info.incoming.pop_front();
        let channel = builder.build(Arc::downgrade(self));

        let Some(remote_id) = remote_id else {
            return Some(channel);
        };
        state.remote_backlog = state.remote_backlog.saturating_sub(1);
        let remote = state.remote_mut(remote_id)?;
        remote.session = Some(channel.clone());
        channel.state().remote_id = remote_id;
        Some(channel)
    }

    pub(crate) fn open_channel(self: &Arc<Self>, channel: &Channel, handshake: Option<Bytes>) -> Result<()> {
        let mut state = self.lock();
        if state.destroyed {
            return Err(state.error.clone().unwrap_or(ProtocolError::Destroyed));
        }
        let remote_id = {
            let channel_state = channel.state();
            if channel_state.closed {
                return Err(ProtocolError::Closed);
            }
            if channel_state.local_id != 0 {
                return Ok(());
            }
            channel_state.remote_id
        };

        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                state.local.push(None);
                state.local.len() - 1
            }
        };
        let local_id = index as u64 + 1;
        state.local[index] = Some(channel.clone());
        channel.state().local_id = local_id;

        let info_id = state.info_for(&channel.inner.protocol, channel.inner.id.as_ref(), &channel.inner.aliases);
        if let Some(info) = state.infos.get_mut(&info_id) {
            info.opened += 1;
            info.last_channel = Some(channel.clone());
            if remote_id == 0 {
                info.outgoing.push_back(local_id);
            }
        }

        let handshake = if channel.inner.declares_handshake {
            handshake.unwrap_or_default()
        } else {
            Bytes::new()
        };
        let body = open_body(&OpenMessage {
            id: local_id,
            protocol: channel.inner.protocol.clone(),
            protocol_id: channel.inner.id.clone(),
            handshake,
        });
        tracing::debug!(protocol = %channel.inner.protocol, local_id, remote_id, "Opening channel");
        let written = self.write_in(&mut state, CONTROL_CHANNEL, body);

        if remote_id != 0 {
            self.fully_open(&mut state, channel, None);
        }
        drop(state);
        self.dispatch();
        written.map(|_| ())
    }

    /// Pairs a channel whose local and remote ids are both known.
    fn fully_open(&self, state: &mut MuxState, channel: &Channel, guard: Option<&Arc<CorkGuard>>) {
        let remote_id = {
            let channel_state = channel.state();
            if channel_state.opened || channel_state.closed {
                return;
            }
            channel_state.remote_id
        };
        let Some(remote) = state.remote_mut(remote_id) else {
            return;
        };
        let handshake = remote.handshake.take();
        let pending = remote.pending.take().unwrap_or_default();
        remote.session = Some(channel.clone());

        let handshake = if channel.inner.declares_handshake {
            Some(handshake.unwrap_or_default())
        } else {
            None
        };
        {
            let mut channel_state = channel.state();
            channel_state.opened = true;
            channel_state.handshake = handshake.clone();
        }
        channel.mark_opened();
        tracing::debug!(protocol = %channel.inner.protocol, remote_id, replayed = pending.len(), "Channel paired");

        state.effects.push_back(Effect::Open {
            channel: channel.clone(),
            handshake,
            guard: guard.cloned(),
        });
        for message in pending {
            state.buffered = state.buffered.saturating_sub(buffered_size(&message.payload));
            state.effects.push_back(Effect::Message {
                channel: channel.clone(),
                message_type: message.message_type,
                payload: message.payload,
                guard: None,
            });
        }
        self.resume_maybe(state);
    }

    pub(crate) fn close_channel(self: &Arc<Self>, channel: &Channel) {
        let mut state = self.lock();
        let (local_id, remote_id) = {
            let channel_state = channel.state();
            if channel_state.closed {
                return;
            }
            (channel_state.local_id, channel_state.remote_id)
        };

        let written = if local_id != 0 {
            self.write_in(&mut state, CONTROL_CHANNEL, close_body(local_id))
        } else if remote_id != 0 {
            // Claimed from a remote open but never opened: refuse it.
            channel.state().remote_id = 0;
            self.reject_remote(&mut state, remote_id)
        } else {
            Ok(true)
        };
        if let Err(err) = written {
            tracing::debug!(error = %err, "Failed to announce channel close");
        }
        self.close_in(&mut state, channel, false);
        drop(state);
        self.dispatch();
    }

    /// Marks a channel closed and releases its ids.
    ///
    /// A local id is reused right away only if the peer knew about it;
    /// otherwise it stays taken until the peer's open or reject arrives.
    fn close_in(&self, state: &mut MuxState, channel: &Channel, is_remote: bool) {
        let (local_id, remote_id) = {
            let mut channel_state = channel.state();
            if channel_state.closed {
                return;
            }
            channel_state.closed = true;
            let ids = (channel_state.local_id, channel_state.remote_id);
            channel_state.local_id = 0;
            channel_state.remote_id = 0;
            ids
        };

        let info_id = state.info_of(&channel.key());
        if local_id != 0 {
            if let Some(info) = info_id.and_then(|id| state.infos.get_mut(&id)) {
                info.opened = info.opened.saturating_sub(1);
                if info.last_channel.as_ref() == Some(channel) {
                    info.last_channel = None;
                }
            }
        }
        if remote_id != 0 {
            self.clear_remote(state, remote_id);
            if local_id != 0 {
                state.free.push((local_id - 1) as usize);
            }
        }
        if local_id != 0 {
            if let Some(slot) = state.local.get_mut((local_id - 1) as usize) {
                *slot = None;
            }
        }
        if let Some(info_id) = info_id {
            state.gc(info_id);
        }

        tracing::debug!(protocol = %channel.inner.protocol, local_id, is_remote, "Channel closed");
        channel.mark_closed();
        state.effects.push_back(Effect::Close {
            channel: channel.clone(),
            is_remote,
        });
    }

    /// Forgets a remote channel and anything buffered for it.
    fn clear_remote(&self, state: &mut MuxState, remote_id: u64) {
        let removed = usize::try_from(remote_id.saturating_sub(1))
            .ok()
            .and_then(|index| state.remote.get_mut(index))
            .and_then(Option::take);
        if let Some(pending) = removed.and_then(|remote| remote.pending) {
            let size: usize = pending.iter().map(|p| buffered_size(&p.payload)).sum();
            state.buffered = state.buffered.saturating_sub(size);
        }
        self.resume_maybe(state);
    }

    fn reject_remote(self: &Arc<Self>, state: &mut MuxState, remote_id: u64) -> Result<bool> {
        self.clear_remote(state, remote_id);
        self.write_in(state, CONTROL_CHANNEL, reject_body(remote_id))
    }

    pub(crate) fn send_message(self: &Arc<Self>, channel: &Channel, message_type: u64, payload: Bytes) -> Result<bool> {
        let mut state = self.lock();
        let local_id = {
            let channel_state = channel.state();
            if channel_state.closed {
                return Ok(false);
            }
            channel_state.local_id
        };
        if local_id == 0 {
            return Err(ProtocolError::InvalidControl(format!(
                "send on channel {} before open",
                channel.inner.protocol
            )));
        }
        let body = protocol::control::message_body(message_type, &payload);
        self.write_in(&mut state, local_id, body)
    }

    pub(crate) fn cork(&self) {
        let mut state = self.lock();
        self.cork_in(&mut state);
    }

    fn cork_in(&self, state: &mut MuxState) {
        state.corked += 1;
        if state.corked == 1 {
            state.batch = Some(BatchEncoder::new());
        }
    }

    pub(crate) fn uncork(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.corked == 0 {
            return;
        }
        state.corked -= 1;
        if state.corked > 0 {
            return;
        }
        let frame = state.batch.take().and_then(|mut batch| batch.finish());
        if let Some(frame) = frame {
            if let Err(err) = self.write_frame(&mut state, frame) {
                tracing::debug!(error = %err, "Failed to send batch");
            }
        }
    }

    /// Writes a body for `channel`, into the batch while corked.
    fn write_in(self: &Arc<Self>, state: &mut MuxState, channel: u64, body: Bytes) -> Result<bool> {
        let Some(batch) = state.batch.as_mut() else {
            return self.write_frame(state, encode_frame(channel, &body));
        };
        let full = if batch.byte_size() >= self.options.max_batch {
            batch.finish()
        } else {
            None
        };
        batch.push(channel, body);
        match full {
            Some(frame) => self.write_frame(state, frame).map(|_| true),
            None => Ok(true),
        }
    }

    fn write_frame(self: &Arc<Self>, state: &mut MuxState, frame: Bytes) -> Result<bool> {
        let drained = match self.stream.write(frame) {
            Ok(drained) => drained,
            Err(err) => {
                state.drained = false;
                return Err(err);
            }
        };
        state.drained = drained;
        if !drained && !state.draining {
            state.draining = true;
            tokio::spawn(self.clone().watch_drain());
        }
        Ok(drained)
    }

    /// Tells every open channel once the stream accepts writes again.
    async fn watch_drain(self: Arc<Self>) {
        let drained = self.stream.drained().await;
        {
            let mut state = self.lock();
            state.draining = false;
            if !drained || state.destroyed {
                return;
            }
            state.drained = true;
            let channels: Vec<Channel> = state.local.iter().flatten().cloned().collect();
            state.effects.extend(channels.into_iter().map(Effect::Drain));
        }
        self.dispatch();
    }

    fn pause_maybe(&self, state: &mut MuxState) {
        if state.paused || state.buffered <= self.options.max_buffered {
            return;
        }
        tracing::debug!(buffered = state.buffered, "Pausing reads, unpaired channels over budget");
        state.paused = true;
    }

    fn resume_maybe(&self, state: &mut MuxState) {
        if !state.paused || state.buffered > self.options.max_buffered {
            return;
        }
        tracing::debug!(buffered = state.buffered, "Resuming reads");
        state.paused = false;
        self.resume.notify_one();
    }
}

/// Releases the dispatcher if a handler panics.
struct DispatchReset<'a>(&'a MuxInner);

impl Drop for DispatchReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.lock().dispatching = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use protocol::control::{decode_body, decode_frame, encode_frame, open_body, reject_body};
    use bytes::BytesMut;
    use protocol::control::close_body;
    use protocol::encoding::{decode_from_bytes, encode_uint, Utf8};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::channel::Message;
    use crate::memory::{message_pair, message_pair_with_high_water_mark, MemoryMessageStream};

    const WAIT: Duration = Duration::from_secs(5);

    fn mux_pair() -> (Mux, Mux) {
        let (a, b) = message_pair();
        (Mux::new(a), Mux::new(b))
    }

    /// A multiplexer whose peer is driven by hand.
    fn mux_with_peer() -> (Mux, MemoryMessageStream) {
        let (a, b) = message_pair();
        (Mux::new(a), b)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out")
            .expect("sender dropped")
    }

    async fn read_frame(peer: &MemoryMessageStream) -> Frame {
        let frame = timeout(WAIT, peer.recv())
            .await
            .expect("timed out")
            .unwrap()
            .expect("stream ended");
        decode_frame(frame).unwrap()
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    /// Registers a text message that forwards everything it receives.
    fn forward_text(channel: &Channel) -> (Message<Utf8>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let message = channel.add_message(Utf8, move |text: String, _: &Channel| {
            let _ = tx.send(text);
            Ok(())
        });
        (message, rx)
    }

    #[tokio::test]
    async fn test_echo_through_pair_handler() {
        let (a, b) = mux_pair();

        b.pair("echo", None, |mux, _id| {
            let channel = mux
                .channel("echo")
                .create()
                .ok_or_else(|| anyhow::anyhow!("echo channel exists"))?;
            let reply = Arc::new(std::sync::OnceLock::<Message<Utf8>>::new());
            let sender = reply.clone();
            let message = channel.add_message(Utf8, move |text: String, _: &Channel| {
                if let Some(reply) = sender.get() {
                    reply.send(&format!("echo: {text}"))?;
                }
                Ok(())
            });
            let _ = reply.set(message);
            channel.open(None)?;
            Ok(())
        });

        let channel = a.channel("echo").create().unwrap();
        let (message, mut rx) = forward_text(&channel);
        channel.open(None).unwrap();
        message.send(&"hello world".to_string()).unwrap();

        assert_eq!(next(&mut rx).await, "echo: hello world");
        assert!(channel.fully_opened().await);
        assert!(a.opened("echo", None));
        assert!(b.opened("echo", None));
    }

    #[tokio::test]
    async fn test_simultaneous_open_exchanges_handshakes() {
        let (a, b) = mux_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let open = |mux: &Mux, payload: &'static [u8], tx: mpsc::UnboundedSender<Option<Bytes>>| {
            let channel = mux
                .channel("greet")
                .id(&b"room"[..])
                .handshake(true)
                .on_open(move |handshake: Option<Bytes>, _: &Channel| {
                    let _ = tx.send(handshake);
                    Ok(())
                })
                .create()
                .unwrap();
            channel.open(Some(Bytes::from_static(payload))).unwrap();
            channel
        };
        let left = open(&a, b"from a", tx.clone());
        let right = open(&b, b"from b", tx);

        let mut seen = vec![next(&mut rx).await.unwrap(), next(&mut rx).await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec![Bytes::from_static(b"from a"), Bytes::from_static(b"from b")]);
        assert_eq!(left.handshake(), Some(Bytes::from_static(b"from b")));
        assert_eq!(right.handshake(), Some(Bytes::from_static(b"from a")));
        assert_eq!(left.id(), Some(&Bytes::from_static(b"room")));
    }

    #[tokio::test]
    async fn test_unclaimed_open_is_rejected() {
        let (a, _b) = mux_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let channel = a
            .channel("nobody")
            .on_close(move |is_remote: bool, _: &Channel| {
                let _ = tx.send(is_remote);
                Ok(())
            })
            .create()
            .unwrap();
        channel.open(None).unwrap();

        assert!(next(&mut rx).await);
        assert!(!channel.fully_opened().await);
        assert!(channel.is_closed());
        assert!(a.is_idle());
    }

    #[tokio::test]
    async fn test_close_is_reported_on_both_sides() {
        let (a, b) = mux_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let make = |mux: &Mux, side: &'static str, tx: mpsc::UnboundedSender<(&'static str, bool)>| {
            let channel = mux
                .channel("pair")
                .on_close(move |is_remote: bool, _: &Channel| {
                    let _ = tx.send((side, is_remote));
                    Ok(())
                })
                .create()
                .unwrap();
            channel.open(None).unwrap();
            channel
        };
        let left = make(&a, "a", tx.clone());
        let right = make(&b, "b", tx);
        assert!(left.fully_opened().await);
        assert!(right.fully_opened().await);

        left.close();
        let mut events = vec![next(&mut rx).await, next(&mut rx).await];
        events.sort();
        assert_eq!(events, vec![("a", false), ("b", true)]);

        timeout(WAIT, right.fully_closed()).await.unwrap();
        eventually(|| a.is_idle() && b.is_idle()).await;
        assert!(!a.opened("pair", None));
    }

    #[tokio::test]
    async fn test_local_id_reused_after_paired_close() {
        let (a, b) = mux_pair();
        b.pair("reuse", None, |mux, _| {
            if let Some(channel) = mux.channel("reuse").create() {
                channel.open(None)?;
            }
            Ok(())
        });

        let first = a.channel("reuse").create().unwrap();
        first.open(None).unwrap();
        assert!(first.fully_opened().await);
        assert_eq!(first.local_id(), Some(1));

        first.close();
        let second = a.channel("other").create().unwrap();
        second.open(None).unwrap();
        assert_eq!(second.local_id(), Some(1));
    }

    #[tokio::test]
    async fn test_unacknowledged_id_held_until_reject() {
        let (a, peer) = mux_with_peer();

        let first = a.channel("x").create().unwrap();
        first.open(None).unwrap();
        first.close();

        let second = a.channel("y").create().unwrap();
        second.open(None).unwrap();
        assert_eq!(second.local_id(), Some(2));

        peer.write(encode_frame(CONTROL_CHANNEL, &reject_body(1))).unwrap();
        eventually(|| a.inner.lock().free == vec![0]).await;

        let third = a.channel("z").create().unwrap();
        third.open(None).unwrap();
        assert_eq!(third.local_id(), Some(1));
    }

    #[tokio::test]
    async fn test_unique_channels() {
        let (a, _peer) = mux_with_peer();

        let first = a.channel("solo").create().unwrap();
        first.open(None).unwrap();
        assert!(a.opened("solo", None));
        assert_eq!(a.get_last_channel("solo", None), Some(first.clone()));

        assert!(a.channel("solo").create().is_none());
        assert!(a.channel("solo").unique(false).create().is_some());
        assert!(a.channel("solo").id(vec![7u8]).create().is_some());
    }

    #[tokio::test]
    async fn test_corked_messages_leave_as_one_batch() {
        let (a, peer) = mux_with_peer();

        let channel = a.channel("batch").create().unwrap();
        let (message, _rx) = forward_text(&channel);
        channel.open(None).unwrap();

        match read_frame(&peer).await {
            Frame::Control(ControlMessage::Open(open)) => {
                assert_eq!(open.id, 1);
                assert_eq!(open.protocol, "batch");
            }
            other => panic!("expected open, got {other:?}"),
        }

        a.cork();
        message.send(&"one".to_string()).unwrap();
        message.send(&"two".to_string()).unwrap();
        a.uncork();

        let Frame::Control(ControlMessage::Batch(entries)) = read_frame(&peer).await else {
            panic!("expected a batch");
        };
        assert_eq!(entries.len(), 2);
        let texts: Vec<String> = entries
            .into_iter()
            .map(|(channel, body)| match decode_body(channel, body).unwrap() {
                Frame::Message {
                    channel,
                    message_type,
                    payload,
                } => {
                    assert_eq!((channel, message_type), (1, 0));
                    decode_from_bytes(&Utf8, payload).unwrap()
                }
                other => panic!("expected message, got {other:?}"),
            })
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_single_corked_message_is_not_batched() {
        let (a, peer) = mux_with_peer();
        let channel = a.channel("one").create().unwrap();
        let (message, _rx) = forward_text(&channel);
        channel.open(None).unwrap();
        read_frame(&peer).await;

        channel.cork();
        message.send(&"alone".to_string()).unwrap();
        channel.uncork();

        assert!(matches!(
            read_frame(&peer).await,
            Frame::Message { channel: 1, message_type: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_open_of_control_channel_is_rejected() {
        let (_a, peer) = mux_with_peer();
        let open = open_body(&OpenMessage {
            id: 0,
            protocol: "sneaky".into(),
            protocol_id: None,
            handshake: Bytes::new(),
        });
        peer.write(encode_frame(CONTROL_CHANNEL, &open)).unwrap();

        assert_eq!(read_frame(&peer).await, Frame::Control(ControlMessage::Reject(0)));
    }

    #[tokio::test]
    async fn test_open_with_skipped_id_destroys() {
        let (a, peer) = mux_with_peer();
        let open = open_body(&OpenMessage {
            id: 5,
            protocol: "gap".into(),
            protocol_id: None,
            handshake: Bytes::new(),
        });
        peer.write(encode_frame(CONTROL_CHANNEL, &open)).unwrap();

        let result = timeout(WAIT, a.closed()).await.unwrap();
        assert!(matches!(result, Err(ProtocolError::InvalidControl(_))));
        assert!(a.is_destroyed());
    }

    #[tokio::test]
    async fn test_nested_batch_destroys() {
        let (a, peer) = mux_with_peer();

        // Headers for each level, innermost first.
        let mut body = close_body(7);
        let mut len = body.len() as u64;
        let mut headers = Vec::new();
        for _ in 0..100_000 {
            let mut header = BytesMut::new();
            encode_uint(&mut header, 0);
            encode_uint(&mut header, CONTROL_CHANNEL);
            encode_uint(&mut header, len);
            len += header.len() as u64;
            headers.push(header);
        }
        let mut nested = BytesMut::with_capacity(len as usize);
        for header in headers.iter().rev() {
            nested.extend_from_slice(header);
        }
        nested.extend_from_slice(&body);
        body = nested.freeze();

        peer.write(encode_frame(CONTROL_CHANNEL, &body)).unwrap();

        let result = timeout(WAIT, a.closed()).await.unwrap();
        assert!(matches!(result, Err(ProtocolError::InvalidControl(_))));
        assert!(a.is_destroyed());
    }

    #[tokio::test]
    async fn test_backlog_limit_destroys() {
        let (a, b) = message_pair();
        let a = Mux::new(a);
        let b = Mux::with_options(
            b,
            MuxOptions {
                max_backlog: Some(1),
                ..MuxOptions::default()
            },
        );
        b.pair_async("slow", None, |_, _| std::future::pending());

        for id in [1u8, 2] {
            let channel = a.channel("slow").id(vec![id]).create().unwrap();
            channel.open(None).unwrap();
        }

        let result = timeout(WAIT, b.closed()).await.unwrap();
        assert!(matches!(result, Err(ProtocolError::InvalidControl(_))));
    }

    #[tokio::test]
    async fn test_unpaired_messages_pause_reading_until_paired() {
        let (a, b) = message_pair();
        let a = Mux::new(a);
        let b = Mux::with_options(
            b,
            MuxOptions {
                max_buffered: 2048,
                ..MuxOptions::default()
            },
        );

        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler_gate = gate.clone();
        b.pair_async("late", None, move |mux, _| {
            let mux = mux.clone();
            let gate = handler_gate.clone();
            let tx = tx.clone();
            async move {
                gate.notified().await;
                let channel = mux
                    .channel("late")
                    .create()
                    .ok_or_else(|| anyhow::anyhow!("late channel exists"))?;
                channel.add_message(Utf8, move |text: String, _: &Channel| {
                    let _ = tx.send(text);
                    Ok(())
                });
                channel.open(None)?;
                Ok(())
            }
        });

        let channel = a.channel("late").create().unwrap();
        let (message, _rx) = forward_text(&channel);
        channel.open(None).unwrap();
        let texts: Vec<String> = (0..10).map(|i| format!("{i:0>1000}")).collect();
        for text in &texts {
            message.send(text).unwrap();
        }

        eventually(|| b.inner.lock().paused).await;
        gate.notify_one();

        for text in &texts {
            assert_eq!(&next(&mut rx).await, text);
        }
        let state = b.inner.lock();
        assert!(!state.paused);
        assert_eq!(state.buffered, 0);
    }

    #[tokio::test]
    async fn test_async_handler_defers_destroy() {
        let (a, b) = mux_pair();
        let gate = Arc::new(Notify::new());
        let (started_tx, mut started) = mpsc::unbounded_channel();

        let left = a.channel("slow").create().unwrap();
        let handler_gate = gate.clone();
        left.add_message_async(Utf8, move |_text: String, _: &Channel| {
            let _ = started_tx.send(());
            let gate = handler_gate.clone();
            async move {
                gate.notified().await;
                Ok(())
            }
        });
        left.open(None).unwrap();

        let right = b.channel("slow").create().unwrap();
        let (message, _rx) = forward_text(&right);
        right.open(None).unwrap();
        assert!(right.fully_opened().await);
        message.send(&"work".to_string()).unwrap();

        next(&mut started).await;
        left.close();
        assert!(left.is_closed());
        assert!(!left.is_destroyed());

        gate.notify_one();
        timeout(WAIT, left.fully_closed()).await.unwrap();
        assert!(left.is_destroyed());
    }

    #[tokio::test]
    async fn test_handler_error_destroys_mux() {
        let (a, b) = mux_pair();

        let left = a.channel("fail").create().unwrap();
        left.add_message(Utf8, |_text: String, _: &Channel| Err(anyhow::anyhow!("boom")));
        left.open(None).unwrap();

        let right = b.channel("fail").create().unwrap();
        let (message, _rx) = forward_text(&right);
        right.open(None).unwrap();
        message.send(&"trigger".to_string()).unwrap();

        let result = timeout(WAIT, a.closed()).await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Handler(msg)) if msg.contains("boom")));
        assert!(left.is_closed());
        timeout(WAIT, b.closed()).await.unwrap().ok();
        assert!(right.is_closed());
    }

    #[tokio::test]
    async fn test_drain_handler_after_backpressure() {
        let (a, b) = message_pair_with_high_water_mark(16);
        let a = Mux::new(a);
        let b = Mux::new(b);
        let right = b.channel("drain").create().unwrap();
        right.open(None).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let channel = a
            .channel("drain")
            .on_drain(move |_: &Channel| {
                let _ = tx.send(());
                Ok(())
            })
            .create()
            .unwrap();
        let (message, _rx) = forward_text(&channel);
        channel.open(None).unwrap();

        assert!(!message.send(&"x".repeat(64)).unwrap());
        assert!(!a.is_drained());
        next(&mut rx).await;
        assert!(a.is_drained());
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let (a, _peer) = mux_with_peer();
        let channel = a.channel("early").create().unwrap();
        let (message, _rx) = forward_text(&channel);
        assert!(matches!(
            message.send(&"too soon".to_string()),
            Err(ProtocolError::InvalidControl(_))
        ));

        channel.close();
        assert!(!message.send(&"too late".to_string()).unwrap());
    }

    #[tokio::test]
    async fn test_remote_end_closes_channels() {
        let (a, peer) = mux_with_peer();
        let channel = a.channel("bye").create().unwrap();
        channel.open(None).unwrap();
        read_frame(&peer).await;

        peer.end();
        timeout(WAIT, a.closed()).await.unwrap().unwrap();
        assert!(channel.is_closed());
        assert!(a.is_destroyed());
        assert!(a.channel("after").create().is_none());
    }

    #[test]
    fn test_options_from_config() {
        let config = MuxConfig {
            max_buffered: 10,
            max_batch: 20,
            max_backlog: Some(3),
        };
        let options = MuxOptions::from_config(&config);
        assert_eq!(options.max_buffered, 10);
        assert_eq!(options.max_batch, 20);
        assert_eq!(options.max_backlog, Some(3));
        assert_eq!(MuxOptions::default().max_buffered, MAX_BUFFERED);
    }
}
