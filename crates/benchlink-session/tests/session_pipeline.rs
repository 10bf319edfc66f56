use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use benchlink_codec::{
    AsciiCodec, BinaryCodec, CodecState, Packet, RegisterOperation, RegisterPacket, START_BYTE,
};
use benchlink_session::{
    BoxFuture, ConsumerError, Operation, PacketConsumer, PacketStore, SessionBuilder,
    SessionConfig, SessionError,
};
use benchlink_storage::ChannelStorage;
use benchlink_transport::{LoopbackTransport, Transport, TransportError};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

async fn loopback(capacity: usize) -> Arc<LoopbackTransport> {
    let transport = Arc::new(LoopbackTransport::with_capacity(capacity));
    transport.connect().await.unwrap();
    transport
}

/// Reads and writes block until the test hands out a permit.
struct GatedTransport {
    reads: Semaphore,
    writes: Semaphore,
    connected: AtomicBool,
}

impl GatedTransport {
    fn new() -> Self {
        Self {
            reads: Semaphore::new(0),
            writes: Semaphore::new(0),
            connected: AtomicBool::new(true),
        }
    }
}

impl Transport for GatedTransport {
    fn name(&self) -> &str {
        "gated"
    }

    async fn connect(&self) -> benchlink_transport::Result<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> benchlink_transport::Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn read(&self, _buf: &mut [u8]) -> benchlink_transport::Result<usize> {
        let permit = self
            .reads
            .acquire()
            .await
            .map_err(|_| TransportError::Shutdown)?;
        permit.forget();
        Ok(0)
    }

    async fn write(&self, data: &[u8]) -> benchlink_transport::Result<usize> {
        let permit = self
            .writes
            .acquire()
            .await
            .map_err(|_| TransportError::Shutdown)?;
        permit.forget();
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn total_bytes_read(&self) -> u64 {
        0
    }

    fn total_bytes_written(&self) -> u64 {
        0
    }
}

struct Rejecting;

impl PacketConsumer for Rejecting {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn on_packet<'a>(&'a self, _: &'a Packet) -> BoxFuture<'a, Result<(), ConsumerError>> {
        Box::pin(async { Err(ConsumerError::Rejected("not today".to_string())) })
    }
}

/// Records command text after a fixed delay per packet.
struct SlowRecorder {
    delay: Duration,
    seen: Mutex<Vec<String>>,
}

impl PacketConsumer for SlowRecorder {
    fn name(&self) -> &str {
        "slow-recorder"
    }

    fn on_packet<'a>(&'a self, packet: &'a Packet) -> BoxFuture<'a, Result<(), ConsumerError>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            if let Some(command) = packet.as_command() {
                self.seen.lock().unwrap().push(command.text.clone());
            }
            Ok(())
        })
    }
}

/// The first read stalls; later reads return nothing. Read start times and
/// the peak number of overlapping reads are recorded.
struct StallingTransport {
    stall: Duration,
    starts: Mutex<Vec<Instant>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Transport for StallingTransport {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn connect(&self) -> benchlink_transport::Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> benchlink_transport::Result<()> {
        Ok(())
    }

    async fn read(&self, _buf: &mut [u8]) -> benchlink_transport::Result<usize> {
        let first = {
            let mut starts = self.starts.lock().unwrap();
            starts.push(Instant::now());
            starts.len() == 1
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if first {
            tokio::time::sleep(self.stall).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn write(&self, data: &[u8]) -> benchlink_transport::Result<usize> {
        Ok(data.len())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn total_bytes_read(&self) -> u64 {
        0
    }

    fn total_bytes_written(&self) -> u64 {
        0
    }
}

#[tokio::test]
async fn test_command_echoes_through_loopback() {
    let storage = ChannelStorage::unbounded();
    let session = SessionBuilder::new(loopback(1024).await, AsciiCodec::default())
        .consumer(PacketStore::commands(storage.clone()))
        .build()
        .unwrap();

    assert_eq!(session.send_command("*IDN?").await.unwrap(), 6);
    assert_eq!(session.read_once().await.unwrap(), 6);
    session.dispose().await;

    assert_eq!(storage.snapshot(), vec!["*IDN?\n"]);
    let stats = session.stats();
    assert_eq!(stats.bytes_read, 6);
    assert_eq!(stats.bytes_written, 6);
    assert_eq!(stats.packets_dispatched, 1);
}

#[tokio::test]
async fn test_register_read_correlates_reply() {
    let session = SessionBuilder::new(loopback(1024).await, AsciiCodec::default())
        .build()
        .unwrap();
    let mut rx = session.subscribe();

    session
        .send_register(RegisterPacket::read_request(0, 0x10))
        .await
        .unwrap();
    assert!(matches!(
        session.codec_state(),
        CodecState::AwaitingRegisterReply(_)
    ));

    // Replace the echoed request with the device's answer.
    session.transport().clear();
    session.transport().write(b"[REG]: 0xAB\n").await.unwrap();
    session.read_once().await.unwrap();

    let reply = rx.recv().await.unwrap();
    let register = reply.as_register().unwrap();
    assert_eq!(register.operation, RegisterOperation::ReadResult);
    assert_eq!(register.address, 0x10);
    assert_eq!(register.value, 0xAB);
    assert_eq!(session.codec_state(), CodecState::Idle);
}

#[tokio::test]
async fn test_concurrent_reads_fail_fast() {
    let transport = Arc::new(GatedTransport::new());
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.read_once().await })
    };
    while !session.is_reading() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        session.read_once().await,
        Err(SessionError::ConcurrentOperation(Operation::Read))
    ));

    // Writes have their own flag.
    transport.writes.add_permits(1);
    assert_eq!(session.send_command("X").await.unwrap(), 2);

    transport.reads.add_permits(1);
    assert_eq!(first.await.unwrap().unwrap(), 0);
    assert!(!session.is_reading());
}

#[tokio::test]
async fn test_concurrent_writes_fail_fast() {
    let transport = Arc::new(GatedTransport::new());
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.send_command("A").await })
    };
    while !session.is_writing() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        session.send_command("B").await,
        Err(SessionError::ConcurrentOperation(Operation::Write))
    ));

    transport.writes.add_permits(1);
    assert_eq!(first.await.unwrap().unwrap(), 2);
    assert!(!session.is_writing());
}

#[tokio::test]
async fn test_cancelled_read_releases_flag() {
    let transport = Arc::new(GatedTransport::new());
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();
    let token = CancellationToken::new();

    let pending = {
        let session = session.clone();
        let token = token.clone();
        tokio::spawn(async move { session.read_once_with(&token).await })
    };
    while !session.is_reading() {
        tokio::task::yield_now().await;
    }

    token.cancel();
    assert_eq!(pending.await.unwrap().unwrap(), 0);
    assert!(!session.is_reading());

    // Aborting the task releases the flag as well.
    let aborted = {
        let session = session.clone();
        tokio::spawn(async move { session.read_once().await })
    };
    while !session.is_reading() {
        tokio::task::yield_now().await;
    }
    aborted.abort();
    assert!(aborted.await.unwrap_err().is_cancelled());
    assert!(!session.is_reading());
}

#[tokio::test]
async fn test_cancelled_write_restores_codec_state() {
    let transport = Arc::new(GatedTransport::new());
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();
    let token = CancellationToken::new();

    let pending = {
        let session = session.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let request = Packet::Register(RegisterPacket::read_request(0, 4));
            session.write_with(&request, &token).await
        })
    };
    while !session.is_writing() {
        tokio::task::yield_now().await;
    }
    assert!(matches!(
        session.codec_state(),
        CodecState::AwaitingRegisterReply(_)
    ));

    token.cancel();
    assert_eq!(pending.await.unwrap().unwrap(), 0);
    assert_eq!(session.codec_state(), CodecState::Idle);
    assert_eq!(session.total_bytes_written(), 0);
}

#[tokio::test]
async fn test_failed_write_restores_codec_state() {
    let transport = Arc::new(GatedTransport::new());
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();
    transport.writes.close();

    let err = session
        .send_register(RegisterPacket::read_request(0, 4))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Transport(TransportError::Shutdown)
    ));
    assert_eq!(session.codec_state(), CodecState::Idle);
    assert!(!session.is_writing());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_read_still_dispatches_every_packet() {
    let transport = loopback(1024).await;
    let recorder = Arc::new(SlowRecorder {
        delay: Duration::from_millis(50),
        seen: Mutex::new(Vec::new()),
    });
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .shared_consumer(recorder.clone())
        .build()
        .unwrap();

    transport.write(b"A\nB\nC\n").await.unwrap();
    let timed_out = tokio::time::timeout(Duration::from_millis(75), session.read_once()).await;
    assert!(timed_out.is_err());
    assert!(!session.is_reading());

    // Waits for the in-flight dispatch to release the buffer.
    assert_eq!(session.pending_bytes().await, 0);
    assert_eq!(*recorder.seen.lock().unwrap(), vec!["A\n", "B\n", "C\n"]);
    assert_eq!(session.stats().packets_dispatched, 3);
    assert_eq!(session.total_bytes_read(), 6);

    // Nothing is delivered twice.
    assert_eq!(session.read_once().await.unwrap(), 0);
    assert_eq!(recorder.seen.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_failing_consumer_does_not_block_others() {
    let storage = ChannelStorage::unbounded();
    let session = SessionBuilder::new(loopback(1024).await, AsciiCodec::default())
        .consumer(Rejecting)
        .consumer(PacketStore::commands(storage.clone()))
        .build()
        .unwrap();
    assert_eq!(session.consumer_count(), 2);

    session.send_command("A").await.unwrap();
    session.send_command("B").await.unwrap();
    session.read_once().await.unwrap();
    session.dispose().await;

    assert_eq!(storage.snapshot(), vec!["A\n", "B\n"]);
}

#[tokio::test(start_paused = true)]
async fn test_polling_delivers_and_restarts() {
    let transport = loopback(1024).await;
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .polling(Duration::from_millis(10))
        .build()
        .unwrap();
    let mut rx = session.subscribe();
    assert!(session.is_polling());
    assert!(matches!(
        session.start_polling(Duration::from_millis(10)),
        Err(SessionError::AlreadyPolling)
    ));

    transport.write(b"FIRST\n").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Packet::command("FIRST\n"));

    session.stop_polling().await.unwrap();
    assert!(!session.is_polling());

    transport.write(b"SECOND\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    session.start_polling(Duration::from_millis(10)).unwrap();
    assert_eq!(rx.recv().await.unwrap(), Packet::command("SECOND\n"));
    session.dispose().await;
    assert!(!session.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_polling_skips_ticks_during_slow_read() {
    let interval = Duration::from_millis(10);
    let transport = Arc::new(StallingTransport {
        stall: Duration::from_millis(100),
        starts: Mutex::new(Vec::new()),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .polling(interval)
        .build()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(195)).await;
    assert!(session.is_polling());
    session.stop_polling().await.unwrap();

    assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    let starts = transport.starts.lock().unwrap().clone();
    assert!(starts.len() >= 2);
    // At most one read per interval after the stall; missed ticks are
    // dropped rather than replayed back to back.
    assert!(starts.len() <= 12, "{} reads", starts.len());
    for pair in starts.windows(2) {
        assert!(pair[1] - pair[0] >= interval, "{:?}", pair[1] - pair[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_polling_stops_on_malformed_frame() {
    let transport = loopback(1024).await;
    let session = SessionBuilder::new(Arc::clone(&transport), BinaryCodec::default())
        .polling(Duration::from_millis(10))
        .build()
        .unwrap();

    transport.write(&[START_BYTE, 0x7F]).await.unwrap();
    while session.is_polling() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = session.stop_polling().await.unwrap_err();
    assert!(err.is_malformed_frame());
    assert_eq!(session.pending_bytes().await, 2);

    session.reset().await;
    assert_eq!(session.pending_bytes().await, 0);
    session.start_polling(Duration::from_millis(10)).unwrap();
    session.dispose().await;
}

#[tokio::test]
async fn test_packets_before_malformed_frame_are_dispatched() {
    let transport = loopback(1024).await;
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();
    let mut rx = session.subscribe();

    transport.write(b"OK\n").await.unwrap();
    transport.write(&[START_BYTE, 0x7F]).await.unwrap();
    transport.write(b"LATER\n").await.unwrap();

    let err = session.read_once().await.unwrap_err();
    assert!(err.is_malformed_frame());
    assert_eq!(rx.recv().await.unwrap(), Packet::command("OK\n"));
    assert_eq!(session.pending_bytes().await, 8);

    session.reset().await;
    transport.write(b"AGAIN\n").await.unwrap();
    session.read_once().await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Packet::command("AGAIN\n"));
}

#[tokio::test]
async fn test_dispose_tears_everything_down() {
    let transport = loopback(1024).await;
    let storage = ChannelStorage::unbounded();
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .consumer(PacketStore::packets(storage.clone()))
        .polling(Duration::from_millis(5))
        .build()
        .unwrap();

    session.dispose().await;
    session.dispose().await;

    assert!(session.is_disposed());
    assert!(!session.is_polling());
    assert!(!transport.is_connected());
    assert!(storage.is_closed());
    assert!(matches!(
        session.send_command("late").await,
        Err(SessionError::Closed)
    ));
}

#[tokio::test]
async fn test_event_pump_feeds_dispatch() {
    let transport = loopback(1024).await;
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();
    let mut rx = session.subscribe();

    session.start_event_pump().unwrap();
    assert!(matches!(
        session.start_event_pump(),
        Err(SessionError::Transport(TransportError::AlreadySubscribed))
    ));

    session.send_command("EVT").await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), Packet::command("EVT\n"));
    assert_eq!(session.total_bytes_read(), 4);
    assert_eq!(transport.available(), 0);

    session.stop_event_pump().await.unwrap();
    session.dispose().await;
}

#[tokio::test]
async fn test_small_reads_yield_same_packets() {
    let session = SessionBuilder::new(loopback(1024).await, AsciiCodec::default())
        .config(SessionConfig {
            read_chunk_size: 3,
            ..Default::default()
        })
        .build()
        .unwrap();
    let mut rx = session.subscribe();

    for text in ["MEAS:VOLT?", "MEAS:CURR?", "SYST:ERR?"] {
        session.send_command(text).await.unwrap();
    }
    while session.read_once().await.unwrap() > 0 {}

    let mut seen = Vec::new();
    while let Ok(packet) = rx.try_recv() {
        seen.push(packet);
    }
    assert_eq!(
        seen,
        vec![
            Packet::command("MEAS:VOLT?\n"),
            Packet::command("MEAS:CURR?\n"),
            Packet::command("SYST:ERR?\n"),
        ]
    );
}

#[tokio::test]
async fn test_short_write_reports_accepted_count() {
    let session = SessionBuilder::new(loopback(8).await, AsciiCodec::default())
        .build()
        .unwrap();
    assert_eq!(session.send_command("0123456789").await.unwrap(), 7);
    assert_eq!(session.total_bytes_written(), 7);
    assert_eq!(session.transport().free_space(), 0);
}

#[tokio::test]
async fn test_disconnected_transport() {
    let transport = loopback(64).await;
    let session = SessionBuilder::new(Arc::clone(&transport), AsciiCodec::default())
        .build()
        .unwrap();
    transport.disconnect().await.unwrap();

    assert!(matches!(
        session.read_once().await,
        Err(SessionError::NotConnected)
    ));
    assert!(matches!(
        session.send_command("X").await,
        Err(SessionError::NotConnected)
    ));
}
