use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// A duplex byte channel to one device.
///
/// Methods take `&self` so a session can drive reads and writes from
/// different tasks; implementations serialize internally where the
/// underlying link needs it.
///
/// A read that times out is not an error: it reports `Ok(0)` so a polling
/// loop keeps running. Reads and writes on a disconnected transport fail
/// with [`TransportError::NotConnected`](crate::TransportError::NotConnected).
pub trait Transport: Send + Sync + 'static {
    /// Human-readable link name used in log output.
    fn name(&self) -> &str;

    /// Open the link.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Close the link. Closing an already closed link is a no-op.
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Read up to `buf.len()` bytes. Returns the number of bytes copied.
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Write `data`, returning how many bytes the link accepted.
    ///
    /// Links with bounded buffering may accept fewer bytes than offered;
    /// callers must check the count.
    fn write(&self, data: &[u8]) -> impl Future<Output = Result<usize>> + Send;

    /// Whether the link is currently open.
    fn is_connected(&self) -> bool;

    /// Cumulative bytes handed out by [`Transport::read`].
    fn total_bytes_read(&self) -> u64;

    /// Cumulative bytes accepted by [`Transport::write`].
    fn total_bytes_written(&self) -> u64;
}

/// Bytes pushed by the device, stamped on arrival.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub timestamp: Instant,
    pub data: Bytes,
}

impl TransportEvent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            timestamp: Instant::now(),
            data: data.into(),
        }
    }
}

/// A transport whose device delivers data on its own instead of waiting to
/// be polled.
pub trait EventCapableTransport: Transport {
    /// Take the receiving end of the event channel.
    ///
    /// Only one subscriber is supported; a second call fails with
    /// [`TransportError::AlreadySubscribed`](crate::TransportError::AlreadySubscribed).
    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>>;
}

impl<T: Transport> Transport for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn connect(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).connect()
    }

    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).disconnect()
    }

    fn read(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send {
        (**self).read(buf)
    }

    fn write(&self, data: &[u8]) -> impl Future<Output = Result<usize>> + Send {
        (**self).write(data)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn total_bytes_read(&self) -> u64 {
        (**self).total_bytes_read()
    }

    fn total_bytes_written(&self) -> u64 {
        (**self).total_bytes_written()
    }
}

impl<T: EventCapableTransport> EventCapableTransport for Arc<T> {
    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        (**self).subscribe()
    }
}
