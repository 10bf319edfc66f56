use std::fmt;

use benchlink_codec::CodecError;
use benchlink_transport::TransportError;

/// The single-flight operation a [`SessionError::ConcurrentOperation`]
/// refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Errors that can occur in session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Encoding failed, or the inbound stream is malformed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Another call of the same operation is in flight. Retry later.
    #[error("{0} already in progress")]
    ConcurrentOperation(Operation),

    /// Polling was started twice.
    #[error("polling already active")]
    AlreadyPolling,

    /// The transport is not connected.
    #[error("transport not connected")]
    NotConnected,

    /// The session has been disposed.
    #[error("session closed")]
    Closed,

    /// Undecoded bytes exceeded the configured limit.
    #[error("undecoded backlog too large ({size} bytes, max {max})")]
    BufferOverflow { size: usize, max: usize },
}

impl From<TransportError> for SessionError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::NotConnected => Self::NotConnected,
            other => Self::Transport(other),
        }
    }
}

impl SessionError {
    /// Whether the inbound stream is desynchronized and needs a reset.
    pub fn is_malformed_frame(&self) -> bool {
        matches!(self, Self::Codec(CodecError::MalformedFrame(_)))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
