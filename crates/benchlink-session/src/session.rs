use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use benchlink_codec::{Codec, CodecState, Packet, RegisterPacket};
use benchlink_transport::{EventCapableTransport, Transport};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::SessionConfig;
use crate::consumer::PacketConsumer;
use crate::dispatch::Dispatcher;
use crate::error::{Operation, Result, SessionError};
use crate::guard::Flight;
use crate::pool::BufferPool;

/// Cumulative counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub packets_dispatched: u64,
}

struct BackgroundTask {
    token: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl BackgroundTask {
    async fn stop(self) -> Result<()> {
        self.token.cancel();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "session task ended abnormally");
                Ok(())
            }
        }
    }
}

struct Inner<T, C> {
    transport: T,
    codec: C,
    config: SessionConfig,
    codec_state: Mutex<CodecState>,
    /// Bytes read but not yet decoded. Held across decode and dispatch so
    /// packets from different ingest paths never interleave.
    pending: tokio::sync::Mutex<BytesMut>,
    reading: Flight,
    writing: Flight,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    packets_dispatched: AtomicU64,
    pool: BufferPool,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    polling: Mutex<Option<BackgroundTask>>,
    pump: Mutex<Option<BackgroundTask>>,
}

impl<T, C> Inner<T, C> {
    fn codec_state(&self) -> MutexGuard<'_, CodecState> {
        self.codec_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builds a [`Session`] from a connected transport and a codec.
pub struct SessionBuilder<T, C> {
    transport: T,
    codec: C,
    consumers: Vec<Arc<dyn PacketConsumer>>,
    config: SessionConfig,
    polling: Option<Duration>,
}

impl<T, C> SessionBuilder<T, C>
where
    T: Transport,
    C: Codec,
{
    pub fn new(transport: T, codec: C) -> Self {
        Self {
            transport,
            codec,
            consumers: Vec::new(),
            config: SessionConfig::default(),
            polling: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a consumer. Consumers are notified in registration order.
    pub fn consumer(mut self, consumer: impl PacketConsumer) -> Self {
        self.consumers.push(Arc::new(consumer));
        self
    }

    /// Register a consumer the caller keeps a handle to.
    pub fn shared_consumer(mut self, consumer: Arc<dyn PacketConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Start polling at `interval` as soon as the session is built.
    pub fn polling(mut self, interval: Duration) -> Self {
        self.polling = Some(interval);
        self
    }

    /// Build the session. The transport must already be connected.
    pub fn build(self) -> Result<Session<T, C>> {
        if !self.transport.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let config = self.config.validated();
        debug!(
            transport = self.transport.name(),
            codec = self.codec.name(),
            consumers = self.consumers.len(),
            "session created"
        );
        let session = Session {
            inner: Arc::new(Inner {
                pool: BufferPool::new(config.pool_slots, config.read_chunk_size),
                dispatcher: Dispatcher::new(self.consumers, config.broadcast_capacity),
                transport: self.transport,
                codec: self.codec,
                config,
                codec_state: Mutex::new(CodecState::default()),
                pending: tokio::sync::Mutex::new(BytesMut::new()),
                reading: Flight::default(),
                writing: Flight::default(),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                packets_dispatched: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                disposed: AtomicBool::new(false),
                polling: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        };
        if let Some(interval) = self.polling {
            session.start_polling(interval)?;
        }
        Ok(session)
    }
}

/// One open link: transport, codec, intermediate buffer and consumers.
///
/// Cloning yields another handle to the same session.
pub struct Session<T, C> {
    inner: Arc<Inner<T, C>>,
}

impl<T, C> Clone for Session<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C> Session<T, C>
where
    T: Transport,
    C: Codec,
{
    pub fn builder(transport: T, codec: C) -> SessionBuilder<T, C> {
        SessionBuilder::new(transport, codec)
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Current register correlation state.
    pub fn codec_state(&self) -> CodecState {
        *self.inner.codec_state()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_read: self.inner.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            packets_dispatched: self.inner.packets_dispatched.load(Ordering::Relaxed),
        }
    }

    pub fn total_bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.dispatcher.consumer_count()
    }

    pub fn is_reading(&self) -> bool {
        self.inner.reading.is_busy()
    }

    pub fn is_writing(&self) -> bool {
        self.inner.writing.is_busy()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Receive every dispatched packet after the registered consumers
    /// have seen it.
    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.inner.dispatcher.subscribe()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SessionError::Closed);
        }
        if !self.inner.transport.is_connected() {
            return Err(SessionError::NotConnected);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Encode `packet` and write it to the transport.
    ///
    /// Returns the number of bytes the transport accepted. Fails with
    /// [`SessionError::ConcurrentOperation`] if another write is in flight.
    pub async fn write(&self, packet: &Packet) -> Result<usize> {
        self.write_with(packet, &CancellationToken::new()).await
    }

    /// [`Session::write`] that gives up with `Ok(0)` when `cancel` fires
    /// before the transport has taken the bytes.
    pub async fn write_with(&self, packet: &Packet, cancel: &CancellationToken) -> Result<usize> {
        if cancel.is_cancelled() {
            return Ok(0);
        }
        let _guard = self.inner.writing.acquire(Operation::Write)?;
        self.ensure_open()?;

        let (bytes, previous_state) = {
            let mut state = self.inner.codec_state();
            let previous = *state;
            let bytes = self.inner.codec.encode_to_bytes(packet, &mut state)?;
            (bytes, previous)
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.inner.shutdown.cancelled() => None,
            result = self.inner.transport.write(&bytes) => Some(result),
        };
        let written = match written {
            Some(Ok(written)) => written,
            Some(Err(e)) => {
                *self.inner.codec_state() = previous_state;
                return Err(e.into());
            }
            None => {
                *self.inner.codec_state() = previous_state;
                trace!("write cancelled");
                return Ok(0);
            }
        };

        if written < bytes.len() {
            warn!(
                transport = self.inner.transport.name(),
                encoded = bytes.len(),
                written,
                "short write"
            );
        }
        self.inner
            .bytes_written
            .fetch_add(written as u64, Ordering::Relaxed);
        trace!(kind = %packet.kind(), written, "packet written");
        Ok(written)
    }

    /// Send a text command.
    pub async fn send_command(&self, text: impl Into<String>) -> Result<usize> {
        self.write(&Packet::command(text)).await
    }

    /// Send a register access.
    pub async fn send_register(&self, register: RegisterPacket) -> Result<usize> {
        self.write(&Packet::Register(register)).await
    }

    // -----------------------------------------------------------------------
    // Read path
    // -----------------------------------------------------------------------

    /// Read one chunk, decode every complete packet and dispatch them in
    /// order. Returns the number of bytes read.
    pub async fn read_once(&self) -> Result<usize> {
        self.read_once_with(&CancellationToken::new()).await
    }

    /// [`Session::read_once`] that returns `Ok(0)` when `cancel` fires
    /// while waiting on the transport.
    ///
    /// Once the transport has returned bytes, decoding and dispatch run to
    /// completion on their own task, even if this future is dropped.
    pub async fn read_once_with(&self, cancel: &CancellationToken) -> Result<usize> {
        if cancel.is_cancelled() {
            return Ok(0);
        }
        let _guard = self.inner.reading.acquire(Operation::Read)?;
        self.ensure_open()?;

        let mut buf = self.inner.pool.rent();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.inner.shutdown.cancelled() => None,
            result = self.inner.transport.read(&mut buf[..]) => Some(result),
        };
        let n = match read {
            Some(result) => result?,
            None => {
                trace!("read cancelled");
                return Ok(0);
            }
        };
        if n == 0 {
            return Ok(0);
        }

        self.inner.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        let chunk = Bytes::copy_from_slice(&buf[..n]);
        drop(buf);

        let session = self.clone();
        match tokio::spawn(async move { session.ingest(&chunk).await }).await {
            Ok(result) => result?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                error!(error = %e, "ingest task cancelled");
                return Err(SessionError::Closed);
            }
        };
        Ok(n)
    }

    /// Append `bytes` to the intermediate buffer, decode and dispatch.
    ///
    /// Packets decoded before a malformed frame are still dispatched; the
    /// error is returned afterwards and the offending bytes stay buffered
    /// until [`Session::reset`].
    async fn ingest(&self, bytes: &[u8]) -> Result<usize> {
        let mut pending = self.inner.pending.lock().await;
        let max = self.inner.config.max_pending;
        if pending.len() + bytes.len() > max {
            return Err(SessionError::BufferOverflow {
                size: pending.len() + bytes.len(),
                max,
            });
        }
        pending.extend_from_slice(bytes);

        let mut decoded = Vec::new();
        let outcome = {
            let mut state = self.inner.codec_state();
            loop {
                match self.inner.codec.try_decode(&mut pending, &mut state) {
                    Ok(Some(packet)) => decoded.push(packet),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        };

        let count = decoded.len();
        for packet in decoded {
            self.inner.dispatcher.dispatch(packet).await;
            self.inner.packets_dispatched.fetch_add(1, Ordering::Relaxed);
        }
        trace!(bytes = bytes.len(), packets = count, buffered = pending.len(), "ingested");

        if let Err(e) = outcome {
            error!(
                codec = self.inner.codec.name(),
                error = %e,
                buffered = pending.len(),
                "inbound stream malformed"
            );
            return Err(e.into());
        }
        Ok(count)
    }

    /// Undecoded bytes currently buffered.
    pub async fn pending_bytes(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Drop undecoded bytes and any pending register correlation, e.g.
    /// after a malformed frame.
    pub async fn reset(&self) {
        let mut pending = self.inner.pending.lock().await;
        let dropped = pending.len();
        pending.clear();
        self.inner.codec_state().reset();
        debug!(dropped, "session buffer reset");
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Call [`Session::read_once`] once per `interval` tick on a background
    /// task. Ticks that come due while a read is still running are skipped.
    ///
    /// The loop stops on a transport or codec error; [`Session::stop_polling`]
    /// returns that error.
    pub fn start_polling(&self, interval: Duration) -> Result<()> {
        if self.is_disposed() {
            return Err(SessionError::Closed);
        }
        let mut slot = self
            .inner
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(SessionError::AlreadyPolling);
        }

        let token = self.inner.shutdown.child_token();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(&self.inner),
            interval,
            token.clone(),
        ));
        *slot = Some(BackgroundTask { token, handle });
        debug!(?interval, "polling started");
        Ok(())
    }

    /// Whether a polling loop is registered and still running.
    pub fn is_polling(&self) -> bool {
        self.inner
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stop the polling loop and return how it ended. A no-op if polling
    /// was never started.
    pub async fn stop_polling(&self) -> Result<()> {
        let task = self
            .inner
            .polling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                let result = task.stop().await;
                debug!("polling stopped");
                result
            }
            None => Ok(()),
        }
    }

    /// Feed transport events into the same decode and dispatch path as
    /// polled reads.
    pub fn start_event_pump(&self) -> Result<()>
    where
        T: EventCapableTransport,
    {
        if self.is_disposed() {
            return Err(SessionError::Closed);
        }
        let mut slot = self.inner.pump.lock().unwrap_or_else(PoisonError::into_inner);
        let mut events = self.inner.transport.subscribe()?;
        let token = self.inner.shutdown.child_token();
        let weak = Arc::downgrade(&self.inner);
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let session = Session { inner };
                session
                    .inner
                    .bytes_read
                    .fetch_add(event.data.len() as u64, Ordering::Relaxed);
                if let Err(e) = session.ingest(&event.data).await {
                    error!(error = %e, "event pump stopped");
                    return Err(e);
                }
            }
            trace!("event pump exited");
            Ok(())
        });
        *slot = Some(BackgroundTask { token, handle });
        debug!("event pump started");
        Ok(())
    }

    /// Stop the event pump and return how it ended.
    pub async fn stop_event_pump(&self) -> Result<()> {
        let task = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => task.stop().await,
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Cancel polling and the event pump, wait for in-flight reads and
    /// writes to release, dispose consumers, drop buffered bytes and
    /// disconnect the transport. Later calls are no-ops.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        if let Err(e) = self.stop_polling().await {
            debug!(error = %e, "polling had stopped with an error");
        }
        if let Err(e) = self.stop_event_pump().await {
            debug!(error = %e, "event pump had stopped with an error");
        }

        self.inner.reading.idle().await;
        self.inner.writing.idle().await;

        self.reset().await;
        self.inner.dispatcher.dispose().await;

        if let Err(e) = self.inner.transport.disconnect().await {
            warn!(transport = self.inner.transport.name(), error = %e, "disconnect failed");
        }
        let stats = self.stats();
        debug!(
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            packets = stats.packets_dispatched,
            "session disposed"
        );
    }
}

impl<T, C> std::fmt::Debug for Session<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.inner.config)
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

async fn poll_loop<T, C>(
    inner: Weak<Inner<T, C>>,
    interval: Duration,
    token: CancellationToken,
) -> Result<()>
where
    T: Transport,
    C: Codec,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let session = Session { inner };
        match session.read_once_with(&token).await {
            Ok(_) => {}
            Err(SessionError::ConcurrentOperation(_)) => trace!("read in flight, tick skipped"),
            Err(SessionError::NotConnected) => trace!("transport not connected, tick skipped"),
            Err(SessionError::Closed) => break,
            Err(e) => {
                error!(error = %e, "polling stopped");
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use benchlink_codec::AsciiCodec;
    use benchlink_transport::LoopbackTransport;

    use super::*;

    async fn session() -> Session<Arc<LoopbackTransport>, AsciiCodec> {
        let transport = Arc::new(LoopbackTransport::with_capacity(256));
        transport.connect().await.unwrap();
        SessionBuilder::new(transport, AsciiCodec::default())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_connected_transport() {
        let transport = LoopbackTransport::with_capacity(16);
        let result = SessionBuilder::new(transport, AsciiCodec::default()).build();
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_write_counts_bytes() {
        let session = session().await;
        assert_eq!(session.send_command("*IDN?").await.unwrap(), 6);
        assert_eq!(session.total_bytes_written(), 6);
        assert_eq!(session.transport().available(), 6);
    }

    #[tokio::test]
    async fn test_read_empty_transport() {
        let session = session().await;
        assert_eq!(session.read_once().await.unwrap(), 0);
        assert_eq!(session.stats(), SessionStats::default());
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let session = session().await;
        let token = CancellationToken::new();
        token.cancel();
        session.transport().write(b"X\n").await.unwrap();

        assert_eq!(session.read_once_with(&token).await.unwrap(), 0);
        assert_eq!(
            session
                .write_with(&Packet::command("Y"), &token)
                .await
                .unwrap(),
            0
        );
        assert_eq!(session.transport().available(), 2);
    }

    #[tokio::test]
    async fn test_partial_line_stays_buffered() {
        let session = session().await;
        session.transport().write(b"MEAS").await.unwrap();
        assert_eq!(session.read_once().await.unwrap(), 4);
        assert_eq!(session.pending_bytes().await, 4);
        assert_eq!(session.stats().packets_dispatched, 0);

        session.transport().write(b"?\n").await.unwrap();
        session.read_once().await.unwrap();
        assert_eq!(session.pending_bytes().await, 0);
        assert_eq!(session.stats().packets_dispatched, 1);
    }

    #[tokio::test]
    async fn test_backlog_limit() {
        let transport = Arc::new(LoopbackTransport::with_capacity(256));
        transport.connect().await.unwrap();
        let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
            .config(SessionConfig {
                max_pending: 8,
                ..Default::default()
            })
            .build()
            .unwrap();

        transport.write(b"no newline yet").await.unwrap();
        assert!(matches!(
            session.read_once().await,
            Err(SessionError::BufferOverflow { size: 14, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_polling_twice_rejected() {
        let session = session().await;
        session.start_polling(Duration::from_millis(5)).unwrap();
        assert!(matches!(
            session.start_polling(Duration::from_millis(5)),
            Err(SessionError::AlreadyPolling)
        ));
        assert!(session.is_polling());
        session.stop_polling().await.unwrap();
        assert!(!session.is_polling());
        session.start_polling(Duration::from_millis(5)).unwrap();
        session.dispose().await;
    }

    #[tokio::test]
    async fn test_operations_after_dispose() {
        let session = session().await;
        session.dispose().await;
        session.dispose().await;

        assert!(session.is_disposed());
        assert!(!session.transport().is_connected());
        assert!(matches!(
            session.send_command("X").await,
            Err(SessionError::Closed)
        ));
        assert!(matches!(session.read_once().await, Err(SessionError::Closed)));
        assert!(matches!(
            session.start_polling(Duration::from_millis(5)),
            Err(SessionError::Closed)
        ));
    }
}
