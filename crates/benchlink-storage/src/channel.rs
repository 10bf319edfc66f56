use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{Result, StorageError};

/// Default number of queued items materialized per batch.
pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Configuration for [`ChannelStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Queue depth. `None` means unbounded; `Some(n)` makes writers wait
    /// once `n` items are queued. Default: unbounded.
    pub capacity: Option<usize>,
    /// Most items the consumer moves into the log per lock. Default: 4096.
    pub batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl StorageConfig {
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Default::default()
        }
    }
}

enum QueueSender<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Bounded(tx) => Self::Bounded(tx.clone()),
            Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
        }
    }
}

enum QueueReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

impl<T> QueueReceiver<T> {
    async fn recv_many(&mut self, buf: &mut Vec<T>, limit: usize) -> usize {
        match self {
            Self::Bounded(rx) => rx.recv_many(buf, limit).await,
            Self::Unbounded(rx) => rx.recv_many(buf, limit).await,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    /// Items materialized into the log.
    count: usize,
    /// The consumer has exited; `count` is final.
    drained: bool,
}

/// Materialized items plus the progress signal readers wait on.
struct Log<T> {
    items: RwLock<Vec<T>>,
    progress: watch::Sender<Progress>,
}

impl<T> Log<T> {
    fn items(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write side. Dropping the last handle drops the sender, which lets the
/// consumer drain and exit.
struct Control<T> {
    sender: Mutex<Option<QueueSender<T>>>,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    log: Arc<Log<T>>,
}

/// Queue-fed, append-only log.
///
/// `count`, `item_at` and readers only see items the background consumer
/// has already materialized; a completed `write` may not be visible yet.
/// Enqueue order is preserved in the log regardless of batching.
///
/// Cloning yields another handle to the same storage.
pub struct ChannelStorage<T> {
    control: Arc<Control<T>>,
}

impl<T> Clone for ChannelStorage<T> {
    fn clone(&self) -> Self {
        Self {
            control: Arc::clone(&self.control),
        }
    }
}

impl<T> ChannelStorage<T>
where
    T: Send + Sync + 'static,
{
    /// Create the storage and spawn its consumer on the current tokio
    /// runtime.
    pub fn new(config: StorageConfig) -> Self {
        let batch_size = config.batch_size.max(1);
        let (sender, receiver) = match config.capacity {
            Some(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
            }
        };
        let (progress, _) = watch::channel(Progress::default());
        let log = Arc::new(Log {
            items: RwLock::new(Vec::new()),
            progress,
        });

        let handle = tokio::spawn(consume(Arc::clone(&log), receiver, batch_size));
        debug!(capacity = ?config.capacity, batch_size, "storage consumer started");
        Self {
            control: Arc::new(Control {
                sender: Mutex::new(Some(sender)),
                consumer: tokio::sync::Mutex::new(Some(handle)),
                log,
            }),
        }
    }

    /// Unbounded storage with default batching.
    pub fn unbounded() -> Self {
        Self::new(StorageConfig::default())
    }

    fn sender(&self) -> Result<QueueSender<T>> {
        self.control
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StorageError::Closed)
    }

    /// Enqueue `item`. With a bounded queue this waits for space.
    pub async fn write(&self, item: T) -> Result<()> {
        match self.sender()? {
            QueueSender::Bounded(tx) => tx.send(item).await.map_err(|_| StorageError::Closed),
            QueueSender::Unbounded(tx) => tx.send(item).map_err(|_| StorageError::Closed),
        }
    }

    /// Enqueue `item` without waiting; a full bounded queue yields
    /// [`StorageError::Full`].
    pub fn try_write(&self, item: T) -> Result<()> {
        match self.sender()? {
            QueueSender::Bounded(tx) => tx.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => StorageError::Full,
                mpsc::error::TrySendError::Closed(_) => StorageError::Closed,
            }),
            QueueSender::Unbounded(tx) => tx.send(item).map_err(|_| StorageError::Closed),
        }
    }

    /// Items materialized so far.
    pub fn count(&self) -> usize {
        self.control.log.progress.borrow().count
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Whether `dispose` has been called.
    pub fn is_closed(&self) -> bool {
        self.control
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Wait until at least `n` items are materialized. Returns the count
    /// reached, which is short of `n` only if the storage drained first.
    pub async fn wait_for_count(&self, n: usize) -> usize {
        let mut rx = self.control.log.progress.subscribe();
        let reached = match rx.wait_for(|p| p.count >= n || p.drained).await {
            Ok(progress) => progress.count,
            Err(_) => self.count(),
        };
        reached
    }

    /// A cursor starting at index 0, independent of every other reader.
    pub fn reader(&self) -> StorageReader<T> {
        StorageReader {
            log: Arc::clone(&self.control.log),
            progress: self.control.log.progress.subscribe(),
            cursor: 0,
        }
    }

    /// Stop accepting writes, let the consumer drain what is queued, then
    /// wait for it to exit. Later calls return once draining has finished.
    pub async fn dispose(&self) {
        let sender = self
            .control
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let handle = self.control.consumer.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "storage consumer ended abnormally");
            }
            self.control.log.progress.send_modify(|p| p.drained = true);
            debug!(count = self.count(), "storage disposed");
        }

        let mut rx = self.control.log.progress.subscribe();
        let _ = rx.wait_for(|p| p.drained).await;
    }
}

impl<T> ChannelStorage<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The item at `index`, if materialized.
    pub fn item_at(&self, index: usize) -> Option<T> {
        self.control.log.items().get(index).cloned()
    }

    /// Copy of every materialized item.
    pub fn snapshot(&self) -> Vec<T> {
        self.control.log.items().clone()
    }
}

impl<T> std::fmt::Debug for ChannelStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = *self.control.log.progress.borrow();
        f.debug_struct("ChannelStorage")
            .field("count", &progress.count)
            .field("drained", &progress.drained)
            .finish()
    }
}

async fn consume<T>(log: Arc<Log<T>>, mut receiver: QueueReceiver<T>, batch_size: usize)
where
    T: Send + Sync + 'static,
{
    let mut batch = Vec::with_capacity(batch_size);
    loop {
        let received = receiver.recv_many(&mut batch, batch_size).await;
        if received == 0 {
            break;
        }
        let count = {
            let mut items = log.items.write().unwrap_or_else(PoisonError::into_inner);
            items.append(&mut batch);
            items.len()
        };
        log.progress.send_modify(|p| p.count = count);
        trace!(received, count, "storage batch materialized");
    }
    log.progress.send_modify(|p| p.drained = true);
}

/// Independent read cursor over a [`ChannelStorage`].
pub struct StorageReader<T> {
    log: Arc<Log<T>>,
    progress: watch::Receiver<Progress>,
    cursor: usize,
}

impl<T: Clone> StorageReader<T> {
    /// Index of the next item this reader will return.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// The next materialized item, or `None` if the reader has caught up.
    pub fn try_next(&mut self) -> Option<T> {
        let item = self.log.items().get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(item)
    }

    /// Wait for the next item. Returns `None` once the storage has been
    /// disposed and every item has been read.
    pub async fn next(&mut self) -> Option<T> {
        loop {
            let progress = *self.progress.borrow_and_update();
            if self.cursor < progress.count {
                return self.try_next();
            }
            if progress.drained {
                return None;
            }
            if self.progress.changed().await.is_err() {
                return self.try_next();
            }
        }
    }
}
