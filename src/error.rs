//! Error types for the decode-feed session.

use thiserror::Error;

/// Failure of the underlying byte transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// I/O error while reading or writing the stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel was closed locally while an operation was pending.
    #[error("Channel closed")]
    Closed,
}

/// Malformed framing on the wire. Fatal to the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared frame length is negative once decoded.
    #[error("Negative frame length: {0}")]
    NegativeLength(i64),

    /// Declared frame length exceeds the configured maximum.
    #[error("Frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Accumulated bytes overflowed the frame buffer before a frame boundary.
    #[error("Accumulated {len} bytes without a frame boundary (maximum {max})")]
    AccumulationOverflow { len: usize, max: usize },
}

/// Failure reported by, or while driving, the decoder capability.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecoderError {
    #[error("Decoder configuration failed: {0}")]
    Configure(String),

    #[error("Decoder is not started")]
    NotStarted,

    #[error("Unknown input slot {0}")]
    UnknownSlot(u32),

    #[error("Input of {len} bytes exceeds slot capacity {capacity}")]
    SlotOverflow { len: usize, capacity: usize },

    #[error("Unknown output buffer {0}")]
    UnknownOutput(u64),

    #[error("Decoder internal error: {0}")]
    Internal(String),
}

/// Reason a feed session left the streaming state.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] DecoderError),

    /// External stop request. Not a failure, but it takes the same cleanup path.
    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;
