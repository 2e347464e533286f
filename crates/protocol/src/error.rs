//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
///
/// Errors are cheap to clone so a single failure can be handed to every
/// pending waiter of a stream or multiplexer when it is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A nonce or counter ran out of values.
    #[error("nonce space exhausted")]
    NonceExhausted,

    // Handshake errors
    /// Noise protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The handshake already failed and cannot be used again.
    #[error("handshake terminated: a failed handshake cannot be resumed")]
    HandshakeTerminated,

    /// Attempted to use transport before handshake completion.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,

    /// The stream id header received after the handshake was rejected.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    // Frame errors
    /// A declared frame length exceeds the allowed maximum.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A message is too large to be encrypted or framed.
    #[error("message too large: {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A received frame is malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    // Multiplexer errors
    /// A multiplexer control message referenced unknown state.
    #[error("invalid control message: {0}")]
    InvalidControl(String),

    /// An application message handler returned an error.
    #[error("handler failed: {0}")]
    Handler(String),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The stream was destroyed.
    #[error("stream destroyed")]
    Destroyed,

    /// The channel was closed.
    #[error("channel closed")]
    Closed,

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns whether the error came from the cryptographic layer.
    ///
    /// Such errors mean the byte stream can no longer be trusted.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decryption(_)
                | ProtocolError::HandshakeFailed(_)
                | ProtocolError::InvalidHeader(_)
                | ProtocolError::InvalidFrame(_)
                | ProtocolError::FrameTooLarge { .. }
        )
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<chacha20poly1305::aead::Error> for ProtocolError {
    fn from(_: chacha20poly1305::aead::Error) -> Self {
        ProtocolError::Decryption("authentication tag mismatch".to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
