//! Multiplexer wire format.
//!
//! Every message on a multiplexed stream starts with the sender's channel id:
//!
//! ```text
//! data     uint channel | uint type | payload
//! control  0            | uint type | body
//!
//! type 0 batch   uint channel | (uint len | message)* ; len 0 => uint channel
//! type 1 open    uint id | string protocol | buffer id | handshake...
//! type 2 reject  uint id
//! type 3 close   uint id
//! ```
//!
//! A message body is everything after the channel id, so batch entries and
//! standalone frames share one encoding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::{
    decode_buffer, decode_string, decode_uint, encode_buffer, encode_string, encode_uint,
    uint_len, State,
};
use crate::error::{ProtocolError, Result};

/// Channel id reserved for control messages.
pub const CONTROL_CHANNEL: u64 = 0;

/// Control message discriminators.
pub const TYPE_BATCH: u64 = 0;
pub const TYPE_OPEN: u64 = 1;
pub const TYPE_REJECT: u64 = 2;
pub const TYPE_CLOSE: u64 = 3;

/// Announces a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    /// The sender's local id for the channel.
    pub id: u64,
    /// Protocol name.
    pub protocol: String,
    /// Optional disambiguator between channels of one protocol.
    pub protocol_id: Option<Bytes>,
    /// Handshake payload; empty when the channel declares none.
    pub handshake: Bytes,
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Message bodies grouped by channel.
    Batch(Vec<(u64, Bytes)>),
    Open(OpenMessage),
    /// The peer refused our open for the given local id.
    Reject(u64),
    /// The peer closed its channel with the given id.
    Close(u64),
    /// A control type this version does not know; ignored.
    Unknown(u64),
}

/// A decoded multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Message {
        /// The sender's local id.
        channel: u64,
        /// Ordinal of the registered message type.
        message_type: u64,
        /// Encoded payload.
        payload: Bytes,
    },
}

/// Encodes the body of a data message.
pub fn message_body(message_type: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(uint_len(message_type) + payload.len());
    encode_uint(&mut buf, message_type);
    buf.put_slice(payload);
    buf.freeze()
}

/// Prefixes a body with its channel id.
pub fn encode_frame(channel: u64, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(uint_len(channel) + body.len());
    encode_uint(&mut buf, channel);
    buf.put_slice(body);
    buf.freeze()
}

/// Body of an open message.
pub fn open_body(open: &OpenMessage) -> Bytes {
    let mut buf = BytesMut::new();
    encode_uint(&mut buf, TYPE_OPEN);
    encode_uint(&mut buf, open.id);
    encode_string(&mut buf, &open.protocol);
    encode_buffer(&mut buf, open.protocol_id.as_deref());
    buf.put_slice(&open.handshake);
    buf.freeze()
}

fn id_body(message_type: u64, id: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + uint_len(id));
    encode_uint(&mut buf, message_type);
    encode_uint(&mut buf, id);
    buf.freeze()
}

/// Body of a reject message for the peer's channel `id`.
pub fn reject_body(id: u64) -> Bytes {
    id_body(TYPE_REJECT, id)
}

/// Body of a close message for our channel `id`.
pub fn close_body(id: u64) -> Bytes {
    id_body(TYPE_CLOSE, id)
}

/// Decodes a full frame.
pub fn decode_frame(frame: Bytes) -> Result<Frame> {
    let mut state = State::new(frame);
    let channel = decode_uint(&mut state)?;
    decode_body(channel, state.rest())
}

/// Decodes a body that arrived for `channel`, standalone or in a batch.
pub fn decode_body(channel: u64, body: Bytes) -> Result<Frame> {
    let mut state = State::new(body);
    let message_type = decode_uint(&mut state)?;
    if channel != CONTROL_CHANNEL {
        return Ok(Frame::Message {
            channel,
            message_type,
            payload: state.rest(),
        });
    }

    let control = match message_type {
        TYPE_BATCH => ControlMessage::Batch(decode_batch(&mut state)?),
        TYPE_OPEN => ControlMessage::Open(OpenMessage {
            id: decode_uint(&mut state)?,
            protocol: decode_string(&mut state)?,
            protocol_id: decode_buffer(&mut state)?,
            handshake: state.rest(),
        }),
        TYPE_REJECT => ControlMessage::Reject(decode_uint(&mut state)?),
        TYPE_CLOSE => ControlMessage::Close(decode_uint(&mut state)?),
        other => ControlMessage::Unknown(other),
    };
    Ok(Frame::Control(control))
}

fn decode_batch(state: &mut State) -> Result<Vec<(u64, Bytes)>> {
    let mut channel = decode_uint(state)?;
    let mut entries = Vec::new();
    while !state.is_empty() {
        let len = decode_uint(state)?;
        if len == 0 {
            channel = decode_uint(state)?;
            continue;
        }
        let len = usize::try_from(len)
            .map_err(|_| ProtocolError::InvalidControl(format!("batch entry of {} bytes", len)))?;
        entries.push((channel, state.take(len)?));
    }
    Ok(entries)
}

/// Accumulates message bodies into a single batch frame.
#[derive(Debug, Default)]
pub struct BatchEncoder {
    entries: Vec<(u64, Bytes)>,
    size: usize,
}

impl BatchEncoder {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether nothing was queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of queued bodies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Approximate size of the queued bodies.
    pub fn byte_size(&self) -> usize {
        self.size
    }

    /// Queues a body for `channel`.
    pub fn push(&mut self, channel: u64, body: Bytes) {
        self.size += body.len();
        self.entries.push((channel, body));
    }

    /// Encodes the queued bodies and resets the batch.
    ///
    /// A single entry is sent as a plain frame rather than a batch.
    pub fn finish(&mut self) -> Option<Bytes> {
        let entries = std::mem::take(&mut self.entries);
        self.size = 0;
        match entries.len() {
            0 => None,
            1 => {
                let (channel, body) = &entries[0];
                Some(encode_frame(*channel, body))
            }
            _ => Some(encode_batch(&entries)),
        }
    }
}

fn encode_batch(entries: &[(u64, Bytes)]) -> Bytes {
    let mut buf = BytesMut::new();
    encode_uint(&mut buf, CONTROL_CHANNEL);
    encode_uint(&mut buf, TYPE_BATCH);
    let mut current = entries[0].0;
    encode_uint(&mut buf, current);
    for (channel, body) in entries {
        if *channel != current {
            encode_uint(&mut buf, 0);
            encode_uint(&mut buf, *channel);
            current = *channel;
        }
        encode_uint(&mut buf, body.len() as u64);
        buf.put_slice(body);
    }
    buf.freeze()
}
