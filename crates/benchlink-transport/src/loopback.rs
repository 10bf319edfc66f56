use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{EventCapableTransport, Transport, TransportEvent};

/// Default ring capacity: 4 MiB.
pub const DEFAULT_CAPACITY: usize = 4 * 1024 * 1024;

/// Smallest usable ring: one data slot plus the reserved slot.
const MIN_CAPACITY: usize = 2;

/// Configuration for [`LoopbackTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Ring size in bytes. One slot stays reserved, so at most
    /// `capacity - 1` bytes are buffered at once. Default: 4 MiB.
    pub capacity: usize,
    /// Depth of the event channel handed out by `subscribe`. Default: 64.
    pub event_capacity: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            event_capacity: 64,
        }
    }
}

impl LoopbackConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.capacity < MIN_CAPACITY {
            warn!(
                capacity = self.capacity,
                min = MIN_CAPACITY,
                "loopback capacity below minimum, clamping"
            );
            self.capacity = MIN_CAPACITY;
        }
        self.event_capacity = self.event_capacity.max(1);
        self
    }
}

struct Ring {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            write_pos: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn available(&self) -> usize {
        (self.write_pos + self.capacity() - self.read_pos) % self.capacity()
    }

    fn free_space(&self) -> usize {
        self.capacity() - self.available() - 1
    }

    fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free_space());
        let first = n.min(self.capacity() - self.write_pos);
        self.buf[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.write_pos = (self.write_pos + n) % self.capacity();
        n
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.available());
        let first = n.min(self.capacity() - self.read_pos);
        out[..first].copy_from_slice(&self.buf[self.read_pos..self.read_pos + first]);
        out[first..n].copy_from_slice(&self.buf[..n - first]);
        self.read_pos = (self.read_pos + n) % self.capacity();
        n
    }

    fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

/// In-process loopback device backed by a fixed-capacity circular buffer.
///
/// Writes copy as many bytes as fit and silently drop the rest; the
/// returned count tells the caller how much was taken. Reads never block
/// and return 0 when the ring is empty. One short critical section covers
/// both cursors.
///
/// After [`EventCapableTransport::subscribe`] the device behaves like an
/// interrupt-driven link: written bytes are delivered as events instead of
/// landing in the ring.
pub struct LoopbackTransport {
    name: String,
    ring: Mutex<Ring>,
    connected: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    event_capacity: usize,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl LoopbackTransport {
    pub fn new(config: LoopbackConfig) -> Self {
        let config = config.validated();
        Self {
            name: "loopback".to_string(),
            ring: Mutex::new(Ring::new(config.capacity)),
            connected: AtomicBool::new(false),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            event_capacity: config.event_capacity,
            events: Mutex::new(None),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(LoopbackConfig::with_capacity(capacity))
    }

    /// Ring size in bytes, including the reserved slot.
    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }

    /// Bytes currently buffered and ready to read.
    pub fn available(&self) -> usize {
        self.ring().available()
    }

    /// Bytes a write could accept right now.
    pub fn free_space(&self) -> usize {
        self.ring().free_space()
    }

    /// Drop all buffered bytes.
    pub fn clear(&self) {
        self.ring().clear();
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn event_sender(&self) -> Option<mpsc::Sender<TransportEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            debug!(name = %self.name, capacity = self.capacity(), "loopback connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(name = %self.name, "loopback disconnected");
        }
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_connected()?;
        let n = self.ring().pop(buf);
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        self.ensure_connected()?;

        if let Some(sender) = self.event_sender() {
            let event = TransportEvent::new(bytes::Bytes::copy_from_slice(data));
            if sender.send(event).await.is_ok() {
                self.bytes_written
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                return Ok(data.len());
            }
            debug!(name = %self.name, "event subscriber dropped, reverting to ring");
            *self.events.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }

        let n = self.ring().push(data);
        if n < data.len() {
            warn!(
                name = %self.name,
                offered = data.len(),
                accepted = n,
                "loopback ring full, write truncated"
            );
        }
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
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

impl EventCapableTransport for LoopbackTransport {
    fn subscribe(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut slot = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::channel(self.event_capacity);
        *slot = Some(tx);
        Ok(rx)
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(capacity: usize) -> LoopbackTransport {
        let transport = LoopbackTransport::with_capacity(capacity);
        transport.connect().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_write_truncates_to_free_space() {
        let transport = connected(8).await;

        let written = transport.write(b"0123456789").await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(transport.free_space(), 0);

        let mut buf = [0u8; 16];
        let read = transport.read(&mut buf).await.unwrap();
        assert_eq!(read, 7);
        assert_eq!(&buf[..read], b"0123456");
    }

    #[tokio::test]
    async fn test_read_empty_returns_zero() {
        let transport = connected(16).await;
        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wraparound_preserves_order() {
        let transport = connected(8).await;
        let mut buf = [0u8; 8];

        assert_eq!(transport.write(b"abcde").await.unwrap(), 5);
        assert_eq!(transport.read(&mut buf[..4]).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");

        // Write position wraps past the end of the ring.
        assert_eq!(transport.write(b"fghijk").await.unwrap(), 6);
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"efghijk");
    }

    #[tokio::test]
    async fn test_many_small_reads_drop_nothing() {
        let transport = connected(64).await;
        let mut received = Vec::new();
        let mut chunk = [0u8; 3];

        for value in 0u32..200 {
            let bytes = value.to_le_bytes();
            assert!(transport.free_space() >= bytes.len());
            assert_eq!(transport.write(&bytes).await.unwrap(), 4);
            if value % 5 == 0 {
                loop {
                    let n = transport.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    received.extend_from_slice(&chunk[..n]);
                }
            }
        }
        loop {
            let n = transport.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
        }

        let values: Vec<u32> = received
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, (0u32..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_counters_track_accepted_bytes() {
        let transport = connected(8).await;
        transport.write(b"0123456789").await.unwrap();
        let mut buf = [0u8; 3];
        transport.read(&mut buf).await.unwrap();

        assert_eq!(transport.total_bytes_written(), 7);
        assert_eq!(transport.total_bytes_read(), 3);
    }

    #[tokio::test]
    async fn test_disconnected_operations_fail() {
        let transport = LoopbackTransport::with_capacity(8);
        let mut buf = [0u8; 4];

        assert!(matches!(
            transport.read(&mut buf).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.write(b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_capacity_clamped_to_minimum() {
        let transport = connected(0).await;
        assert_eq!(transport.capacity(), MIN_CAPACITY);
        assert_eq!(transport.write(b"xy").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_subscribed_writes_become_events() {
        let transport = connected(8).await;
        let mut events = transport.subscribe().unwrap();

        assert_eq!(transport.write(b"0123456789").await.unwrap(), 10);
        let event = events.recv().await.unwrap();
        assert_eq!(event.data.as_ref(), b"0123456789");
        assert_eq!(transport.available(), 0);
    }

    #[tokio::test]
    async fn test_second_subscribe_rejected() {
        let transport = connected(8).await;
        let _events = transport.subscribe().unwrap();
        assert!(matches!(
            transport.subscribe(),
            Err(TransportError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_reverts_to_ring() {
        let transport = connected(8).await;
        drop(transport.subscribe().unwrap());

        assert_eq!(transport.write(b"abc").await.unwrap(), 3);
        assert_eq!(transport.available(), 3);
    }
}
