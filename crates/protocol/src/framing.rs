//! Length-prefixed framing for the secure stream.
//!
//! # Frame Format
//!
//! ```text
//! +----------------------+---------------------------+
//! | length (uint24, LE)  | payload (length bytes)    |
//! +----------------------+---------------------------+
//! ```
//!
//! The same framing carries handshake messages, the post-handshake id
//! header and every encrypted application message.
//!
//! [`FrameParser`] reassembles frames from chunks of any size. It is a
//! plain state machine: the caller pushes a chunk and pulls complete frames
//! until the chunk is exhausted, so a single byte per call works as well as
//! a whole buffer.

use std::mem;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

/// Frame header size: a 24-bit little-endian length.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Largest payload a single frame can describe.
pub const MAX_FRAME_SIZE: usize = 0xFF_FFFF;

/// Encodes a payload length as a 3-byte little-endian header.
pub fn encode_header(len: usize) -> Result<[u8; FRAME_HEADER_SIZE]> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok([len as u8, (len >> 8) as u8, (len >> 16) as u8])
}

/// Decodes a 3-byte little-endian header.
pub fn decode_header(header: [u8; FRAME_HEADER_SIZE]) -> usize {
    header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16
}

/// Wraps `payload` in a frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let header = encode_header(payload.len())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[derive(Debug)]
enum ParseState {
    /// Accumulating the length header, one byte at a time.
    Length { len: usize, factor: usize },
    /// Accumulating a payload of `len` bytes. `buf` stays empty while the
    /// payload can still be sliced straight out of the input.
    Payload { len: usize, buf: BytesMut },
}

impl ParseState {
    fn start() -> Self {
        ParseState::Length { len: 0, factor: 1 }
    }
}

/// Incremental frame parser.
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    max_frame_size: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    /// Creates a parser accepting frames up to [`MAX_FRAME_SIZE`].
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Creates a parser with a lower frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            state: ParseState::start(),
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Returns the current frame size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Changes the frame size limit for headers not yet completed.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE);
    }

    /// Returns whether the parser sits on a frame boundary.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ParseState::Length { factor: 1, .. })
    }

    /// Number of payload bytes still missing for the frame in progress.
    ///
    /// `None` while a length header is being read.
    pub fn remaining(&self) -> Option<usize> {
        match &self.state {
            ParseState::Payload { len, buf } => Some(len - buf.len()),
            ParseState::Length { .. } => None,
        }
    }

    /// Consumes bytes from `input` until one frame completes.
    ///
    /// Returns `Ok(None)` once `input` is exhausted without completing a
    /// frame; the partial state is kept for the next chunk. A declared
    /// length over the limit is an error and leaves the parser unusable.
    pub fn next_frame(&mut self, input: &mut Bytes) -> Result<Option<Bytes>> {
        loop {
            match &mut self.state {
                ParseState::Length { len, factor } => {
                    if input.is_empty() {
                        return Ok(None);
                    }
                    *len += input.get_u8() as usize * *factor;
                    *factor <<= 8;
                    if *factor < 1 << 24 {
                        continue;
                    }

                    let len = *len;
                    if len > self.max_frame_size {
                        return Err(ProtocolError::FrameTooLarge {
                            size: len,
                            max: self.max_frame_size,
                        });
                    }
                    if len == 0 {
                        self.state = ParseState::start();
                        return Ok(Some(Bytes::new()));
                    }
                    self.state = ParseState::Payload {
                        len,
                        buf: BytesMut::new(),
                    };
                }
                ParseState::Payload { len, buf } => {
                    if buf.is_empty() && input.len() >= *len {
                        let frame = input.split_to(*len);
                        self.state = ParseState::start();
                        return Ok(Some(frame));
                    }
                    if input.is_empty() {
                        return Ok(None);
                    }

                    if buf.capacity() == 0 {
                        buf.reserve(*len);
                    }
                    let take = (*len - buf.len()).min(input.len());
                    buf.extend_from_slice(&input.split_to(take));
                    if buf.len() == *len {
                        let frame = mem::take(buf).freeze();
                        self.state = ParseState::start();
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    /// Parses every complete frame in `input`.
    pub fn push(&mut self, mut input: Bytes) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame(&mut input)? {
            frames.push(frame);
        }
        Ok(frames)
    }
}
