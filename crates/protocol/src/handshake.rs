//! Handshake driver used by the secure stream.
//!
//! Wraps a [`HandshakeState`] so that every outgoing Noise message is
//! already framed for the wire, and so that reading a peer message
//! immediately produces our reply when it is our turn.
//!
//! ```text
//! initiator                          responder
//!   start() ── [len|e] ───────────────▶ recv()
//!   recv()  ◀─────── [len|e,ee,s,es] ── (reply)
//!   (reply) ── [len|s,se] ────────────▶ recv()  => complete
//!   => complete
//! ```

use crate::crypto::{Ed25519, KeyPair, PUBLIC_KEY_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::framing;
use crate::noise::{HandshakeOptions, HandshakePhase, HandshakeResult, HandshakeState, Pattern, PSK_LENGTH};

/// Outcome of a handshake step.
#[derive(Debug, Default)]
pub struct HandshakeStep {
    /// A framed message to write to the peer.
    pub reply: Option<Vec<u8>>,
    /// Set when the handshake finished with this step.
    pub complete: Option<HandshakeResult>,
}

/// Framed Noise handshake for one end of a stream.
#[derive(Debug)]
pub struct StreamHandshake {
    noise: HandshakeState<Ed25519>,
}

impl StreamHandshake {
    /// Creates the handshake for one end of a stream.
    pub fn new(
        is_initiator: bool,
        key_pair: KeyPair,
        remote_public_key: Option<[u8; PUBLIC_KEY_LENGTH]>,
        pattern: Pattern,
        psk: Option<[u8; PSK_LENGTH]>,
    ) -> Result<Self> {
        let options = HandshakeOptions {
            remote_static: remote_public_key,
            psk,
            ..Default::default()
        };
        Ok(Self {
            noise: HandshakeState::new(pattern, is_initiator, Some(key_pair), options)?,
        })
    }

    /// Returns whether this end initiates.
    pub fn is_initiator(&self) -> bool {
        self.noise.is_initiator()
    }

    /// Returns the current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.noise.phase()
    }

    /// Produces the opening message if this end speaks first.
    pub fn start(&mut self) -> Result<HandshakeStep> {
        match self.noise.phase() {
            HandshakePhase::Send => self.send(),
            _ => Ok(HandshakeStep::default()),
        }
    }

    /// Consumes one peer message, replying if the pattern requires it.
    pub fn recv(&mut self, message: &[u8]) -> Result<HandshakeStep> {
        self.noise.recv(message)?;
        if self.noise.is_complete() {
            return Ok(HandshakeStep {
                reply: None,
                complete: self.noise.take_result(),
            });
        }
        self.send()
    }

    fn send(&mut self) -> Result<HandshakeStep> {
        let message = self.noise.send(&[])?;
        let reply = framing::encode_frame(&message)?;
        let complete = if self.noise.is_complete() {
            Some(
                self.noise
                    .take_result()
                    .ok_or_else(|| ProtocolError::HandshakeFailed("missing handshake result".into()))?,
            )
        } else {
            None
        };
        Ok(HandshakeStep {
            reply: Some(reply),
            complete,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameParser;
    use bytes::Bytes;

    fn unframe(frame: Vec<u8>) -> Bytes {
        let mut parser = FrameParser::new();
        let mut frames = parser.push(Bytes::from(frame)).unwrap();
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    #[test]
    fn test_xx_stream_handshake() {
        let mut a = StreamHandshake::new(true, KeyPair::generate(), None, Pattern::XX, None).unwrap();
        let mut b = StreamHandshake::new(false, KeyPair::generate(), None, Pattern::XX, None).unwrap();

        assert!(b.start().unwrap().reply.is_none());
        let m1 = a.start().unwrap().reply.unwrap();
        let step = b.recv(&unframe(m1)).unwrap();
        assert!(step.complete.is_none());
        let step = a.recv(&unframe(step.reply.unwrap())).unwrap();
        let a_result = step.complete.unwrap();
        let step = b.recv(&unframe(step.reply.unwrap())).unwrap();
        assert!(step.reply.is_none());
        let b_result = step.complete.unwrap();

        assert_eq!(a_result.tx, b_result.rx);
        assert_eq!(a_result.hash, b_result.hash);
        assert_eq!(a_result.remote_public_key, Some(b_result.public_key));
    }

    #[test]
    fn test_ik_responder_completes_on_reply() {
        let server = KeyPair::generate();
        let server_pk = *server.public_key();
        let mut a = StreamHandshake::new(true, KeyPair::generate(), Some(server_pk), Pattern::IK, None)
            .unwrap();
        let mut b = StreamHandshake::new(false, server, None, Pattern::IK, None).unwrap();

        let m1 = a.start().unwrap().reply.unwrap();
        let step = b.recv(&unframe(m1)).unwrap();
        let b_result = step.complete.unwrap();
        let step = a.recv(&unframe(step.reply.unwrap())).unwrap();
        assert_eq!(step.complete.unwrap().rx, b_result.tx);
    }

    #[test]
    fn test_garbage_fails() {
        let mut b = StreamHandshake::new(false, KeyPair::generate(), None, Pattern::XX, None).unwrap();
        let mut a = StreamHandshake::new(true, KeyPair::generate(), None, Pattern::XX, None).unwrap();
        let m1 = a.start().unwrap().reply.unwrap();
        b.recv(&unframe(m1)).unwrap();
        b.recv(&[0u8; 64]).unwrap_err();
        let step = a.recv(&[1u8; 96]);
        assert!(step.is_err());
        assert_eq!(a.phase(), HandshakePhase::Failed);
    }
}
