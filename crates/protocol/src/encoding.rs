//! Compact binary encoding used by the multiplexer.
//!
//! # Variable-length integers
//!
//! ```text
//! value <= 0xfc          1 byte   value
//! value <= 0xffff        3 bytes  0xfd, u16 LE
//! value <= 0xffff_ffff   5 bytes  0xfe, u32 LE
//! otherwise              9 bytes  0xff, u64 LE
//! ```
//!
//! Strings and buffers are a `uint` length followed by the bytes. An empty
//! buffer decodes as absent.
//!
//! Message payloads are described by a [`Codec`]; the channel layer keeps
//! one codec per registered message type.

use std::marker::PhantomData;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

const MARKER_U16: u8 = 0xfd;
const MARKER_U32: u8 = 0xfe;
const MARKER_U64: u8 = 0xff;

/// Read cursor over a received buffer.
///
/// Slices returned by the decoders share the underlying allocation.
#[derive(Debug, Clone)]
pub struct State {
    buffer: Bytes,
    start: usize,
    end: usize,
}

impl State {
    /// Creates a cursor over the whole buffer.
    pub fn new(buffer: Bytes) -> Self {
        let end = buffer.len();
        Self {
            buffer,
            start: 0,
            end,
        }
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.start
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.end - self.start
    }

    /// Returns whether every byte was consumed.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn underflow(&self, wanted: usize) -> ProtocolError {
        ProtocolError::Deserialization(format!(
            "out of bounds: wanted {} bytes at offset {}, {} left",
            wanted,
            self.start,
            self.remaining()
        ))
    }

    /// Reads exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<Bytes> {
        if len > self.remaining() {
            return Err(self.underflow(len));
        }
        let out = self.buffer.slice(self.start..self.start + len);
        self.start += len;
        Ok(out)
    }

    /// Reads everything that is left.
    pub fn rest(&mut self) -> Bytes {
        let out = self.buffer.slice(self.start..self.end);
        self.start = self.end;
        out
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if N > self.remaining() {
            return Err(self.underflow(N));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[self.start..self.start + N]);
        self.start += N;
        Ok(out)
    }

    /// Reads one byte.
    pub fn byte(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }
}

/// Number of bytes [`encode_uint`] writes for `value`.
pub fn uint_len(value: u64) -> usize {
    if value <= 0xfc {
        1
    } else if value <= 0xffff {
        3
    } else if value <= 0xffff_ffff {
        5
    } else {
        9
    }
}

/// Writes a variable-length unsigned integer.
pub fn encode_uint(buf: &mut BytesMut, value: u64) {
    if value <= 0xfc {
        buf.put_u8(value as u8);
    } else if value <= 0xffff {
        buf.put_u8(MARKER_U16);
        buf.put_u16_le(value as u16);
    } else if value <= 0xffff_ffff {
        buf.put_u8(MARKER_U32);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(MARKER_U64);
        buf.put_u64_le(value);
    }
}

/// Reads a variable-length unsigned integer.
pub fn decode_uint(state: &mut State) -> Result<u64> {
    match state.byte()? {
        MARKER_U16 => Ok(u16::from_le_bytes(state.array()?) as u64),
        MARKER_U32 => Ok(u32::from_le_bytes(state.array()?) as u64),
        MARKER_U64 => Ok(u64::from_le_bytes(state.array()?)),
        n => Ok(n as u64),
    }
}

/// Reads a `uint` that must fit a `usize` length within the remaining input.
fn decode_len(state: &mut State) -> Result<usize> {
    let len = decode_uint(state)?;
    usize::try_from(len)
        .ok()
        .filter(|len| *len <= state.remaining())
        .ok_or_else(|| state.underflow(len.min(usize::MAX as u64) as usize))
}

/// Writes a length-prefixed byte string.
pub fn encode_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    encode_uint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

/// Reads a length-prefixed byte string.
pub fn decode_bytes(state: &mut State) -> Result<Bytes> {
    let len = decode_len(state)?;
    state.take(len)
}

/// Writes a length-prefixed UTF-8 string.
pub fn encode_string(buf: &mut BytesMut, value: &str) {
    encode_bytes(buf, value.as_bytes());
}

/// Reads a length-prefixed UTF-8 string.
pub fn decode_string(state: &mut State) -> Result<String> {
    let bytes = decode_bytes(state)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ProtocolError::Deserialization(format!("invalid utf-8: {}", e)))
}

/// Writes an optional buffer; `None` and empty encode identically.
pub fn encode_buffer(buf: &mut BytesMut, value: Option<&[u8]>) {
    encode_bytes(buf, value.unwrap_or_default());
}

/// Reads an optional buffer; an empty buffer is `None`.
pub fn decode_buffer(state: &mut State) -> Result<Option<Bytes>> {
    let bytes = decode_bytes(state)?;
    Ok((!bytes.is_empty()).then_some(bytes))
}

/// Encoding of one message type.
pub trait Codec: Send + Sync + 'static {
    /// Decoded value.
    type Value: Send + 'static;

    /// Appends the encoding of `value`.
    fn encode(&self, value: &Self::Value, buf: &mut BytesMut) -> Result<()>;

    /// Reads a value from the cursor.
    fn decode(&self, state: &mut State) -> Result<Self::Value>;
}

/// Encodes a single value into a fresh buffer.
pub fn encode_to_bytes<C: Codec>(codec: &C, value: &C::Value) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    codec.encode(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Decodes a single value that must span the whole buffer.
pub fn decode_from_bytes<C: Codec>(codec: &C, bytes: Bytes) -> Result<C::Value> {
    let mut state = State::new(bytes);
    let value = codec.decode(&mut state)?;
    if !state.is_empty() {
        return Err(ProtocolError::Deserialization(format!(
            "{} trailing bytes",
            state.remaining()
        )));
    }
    Ok(value)
}

/// Variable-length `u64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uint;

impl Codec for Uint {
    type Value = u64;

    fn encode(&self, value: &u64, buf: &mut BytesMut) -> Result<()> {
        encode_uint(buf, *value);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<u64> {
        decode_uint(state)
    }
}

macro_rules! fixed_uint {
    ($name:ident, $ty:ty, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Codec for $name {
            type Value = $ty;

            fn encode(&self, value: &$ty, buf: &mut BytesMut) -> Result<()> {
                buf.put_slice(&value.to_le_bytes()[..$len]);
                Ok(())
            }

            fn decode(&self, state: &mut State) -> Result<$ty> {
                let bytes = state.array::<$len>()?;
                let mut full = [0u8; std::mem::size_of::<$ty>()];
                full[..$len].copy_from_slice(&bytes);
                Ok(<$ty>::from_le_bytes(full))
            }
        }
    };
}

fixed_uint!(Uint8, u8, 1, "Single byte.");
fixed_uint!(Uint16, u16, 2, "Little-endian `u16`.");
fixed_uint!(Uint32, u32, 4, "Little-endian `u32`.");

/// Little-endian 24-bit integer carried in a `u32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uint24;

impl Codec for Uint24 {
    type Value = u32;

    fn encode(&self, value: &u32, buf: &mut BytesMut) -> Result<()> {
        if *value > 0xff_ffff {
            return Err(ProtocolError::Serialization(format!(
                "{} does not fit in 24 bits",
                value
            )));
        }
        buf.put_slice(&value.to_le_bytes()[..3]);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<u32> {
        let [a, b, c] = state.array::<3>()?;
        Ok(u32::from_le_bytes([a, b, c, 0]))
    }
}

/// One byte, zero or one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bool;

impl Codec for Bool {
    type Value = bool;

    fn encode(&self, value: &bool, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(*value as u8);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<bool> {
        match state.byte()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(ProtocolError::Deserialization(format!(
                "invalid bool byte {:#04x}",
                b
            ))),
        }
    }
}

/// Length-prefixed UTF-8 string.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Codec for Utf8 {
    type Value = String;

    fn encode(&self, value: &String, buf: &mut BytesMut) -> Result<()> {
        encode_string(buf, value);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<String> {
        decode_string(state)
    }
}

/// Length-prefixed optional buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Buffer;

impl Codec for Buffer {
    type Value = Option<Bytes>;

    fn encode(&self, value: &Option<Bytes>, buf: &mut BytesMut) -> Result<()> {
        encode_buffer(buf, value.as_deref());
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<Option<Bytes>> {
        decode_buffer(state)
    }
}

/// Unprefixed bytes that consume the rest of the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Codec for Raw {
    type Value = Bytes;

    fn encode(&self, value: &Bytes, buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(value);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<Bytes> {
        Ok(state.rest())
    }
}

/// Exactly 32 bytes, such as a public key or a topic.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fixed32;

impl Codec for Fixed32 {
    type Value = [u8; 32];

    fn encode(&self, value: &[u8; 32], buf: &mut BytesMut) -> Result<()> {
        buf.put_slice(value);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<[u8; 32]> {
        state.array()
    }
}

/// Any serde type as a length-prefixed MessagePack document.
pub struct MessagePack<T>(PhantomData<fn() -> T>);

impl<T> MessagePack<T> {
    /// Creates the codec.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for MessagePack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for MessagePack<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn encode(&self, value: &T, buf: &mut BytesMut) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(value)?;
        encode_bytes(buf, &bytes);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<T> {
        let bytes = decode_bytes(state)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }
}

/// Any serde type as a length-prefixed JSON document.
pub struct Json<T>(PhantomData<fn() -> T>);

impl<T> Json<T> {
    /// Creates the codec.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Value = T;

    fn encode(&self, value: &T, buf: &mut BytesMut) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        encode_bytes(buf, &bytes);
        Ok(())
    }

    fn decode(&self, state: &mut State) -> Result<T> {
        let bytes = decode_bytes(state)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
