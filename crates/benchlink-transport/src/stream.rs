use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::Transport;

/// Timeouts for [`StreamTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// How long a read waits for data before reporting 0 bytes. Default: 5s.
    pub read_timeout: Option<Duration>,
    /// How long a write may take before failing. Default: 5s.
    pub write_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_timeout: Some(Duration::from_millis(5000)),
            write_timeout: Some(Duration::from_millis(5000)),
        }
    }
}

/// A [`Transport`] over any async byte stream.
///
/// The stream is split so a read and a write can be in flight at the same
/// time; two reads (or two writes) queue on the half's lock. A read timeout
/// reports `Ok(0)`. End of stream marks the transport disconnected.
pub struct StreamTransport<S> {
    name: String,
    config: StreamConfig,
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    connected: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(name: impl Into<String>, stream: S, config: StreamConfig) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            name: name.into(),
            config,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            connected: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if self.reader.lock().await.is_none() {
            return Err(TransportError::Shutdown);
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            debug!(name = %self.name, "stream transport connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(name = %self.name, error = %e, "stream shutdown failed");
            }
        }
        self.reader.lock().await.take();
        debug!(name = %self.name, "stream transport disconnected");
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_connected()?;
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let n = match self.config.read_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, reader.read(buf)).await {
                Ok(result) => result?,
                Err(_) => {
                    trace!(name = %self.name, "read timed out");
                    return Ok(0);
                }
            },
            None => reader.read(buf).await?,
        };

        if n == 0 && !buf.is_empty() {
            self.connected.store(false, Ordering::Release);
            debug!(name = %self.name, "stream closed by peer");
        }
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        self.ensure_connected()?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let io = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        match self.config.write_timeout {
            Some(timeout) => tokio::time::timeout(timeout, io).await.map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "write timed out")
            })??,
            None => io.await?,
        }

        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn total_bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn total_bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("connected", &self.connected.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick() -> StreamConfig {
        StreamConfig {
            read_timeout: Some(Duration::from_millis(20)),
            write_timeout: Some(Duration::from_millis(20)),
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_duplex() {
        let (a, mut b) = tokio::io::duplex(64);
        let transport = StreamTransport::new("duplex", a, quick());
        transport.connect().await.unwrap();

        assert_eq!(transport.write(b"*IDN?\n").await.unwrap(), 6);
        let mut seen = [0u8; 6];
        b.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"*IDN?\n");

        b.write_all(b"ACME,1\n").await.unwrap();
        let mut buf = [0u8; 32];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ACME,1\n");

        assert_eq!(transport.total_bytes_written(), 6);
        assert_eq!(transport.total_bytes_read(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_zero_bytes() {
        let (a, _b) = tokio::io::duplex(64);
        let transport = StreamTransport::new("duplex", a, quick());
        transport.connect().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let (a, b) = tokio::io::duplex(64);
        let transport = StreamTransport::new("duplex", a, quick());
        transport.connect().await.unwrap();
        drop(b);

        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.read(&mut buf).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect_fails() {
        let (a, _b) = tokio::io::duplex(64);
        let transport = StreamTransport::new("duplex", a, quick());
        transport.connect().await.unwrap();
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();

        assert!(matches!(
            transport.connect().await,
            Err(TransportError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_requires_connect() {
        let (a, _b) = tokio::io::duplex(64);
        let transport = StreamTransport::new("duplex", a, StreamConfig::default());
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }
}
