/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The operation needs an open link but the transport is disconnected.
    #[error("transport not connected")]
    NotConnected,

    /// Failed to open the link.
    #[error("failed to connect {name}: {reason}")]
    Connect { name: String, reason: String },

    /// An I/O error occurred on the underlying stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event delivery was already handed to another subscriber.
    #[error("transport events already subscribed")]
    AlreadySubscribed,

    /// The transport has been shut down and cannot be reopened.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
