//! Packet consumers.
//!
//! A consumer is notified once per decoded packet, in decode order. A
//! failing or panicking consumer is logged and skipped; delivery to the
//! remaining consumers and the read loop carry on.

use std::future::Future;
use std::pin::Pin;

use benchlink_codec::Packet;
use benchlink_storage::{ChannelStorage, StorageError};
use tracing::{debug, error, info, trace, warn, Level};

/// Boxed future returned by consumer callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors a consumer can report back to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    Rejected(String),
}

/// Receives every packet a session decodes.
pub trait PacketConsumer: Send + Sync + 'static {
    /// Name used in log output.
    fn name(&self) -> &str;

    /// Handle one packet. Should return quickly; the next packet waits.
    fn on_packet<'a>(&'a self, packet: &'a Packet) -> BoxFuture<'a, Result<(), ConsumerError>>;

    /// Release resources. Called once when the session is disposed.
    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Writes each packet to `tracing` at a fixed level.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    name: String,
    level: Level,
}

impl TracingLogger {
    pub fn new(name: impl Into<String>, level: Level) -> Self {
        Self {
            name: name.into(),
            level,
        }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("tracing", Level::INFO)
    }
}

impl PacketConsumer for TracingLogger {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_packet<'a>(&'a self, packet: &'a Packet) -> BoxFuture<'a, Result<(), ConsumerError>> {
        let kind = packet.kind();
        match self.level {
            Level::ERROR => error!(consumer = %self.name, %kind, "{packet}"),
            Level::WARN => warn!(consumer = %self.name, %kind, "{packet}"),
            Level::INFO => info!(consumer = %self.name, %kind, "{packet}"),
            Level::DEBUG => debug!(consumer = %self.name, %kind, "{packet}"),
            _ => trace!(consumer = %self.name, %kind, "{packet}"),
        }
        Box::pin(async { Ok(()) })
    }
}

type Projection<T> = Box<dyn Fn(&Packet) -> Option<T> + Send + Sync>;

/// Feeds a [`ChannelStorage`] with the packets a projection selects.
///
/// The projection filters and converts in one step: `None` skips the
/// packet. Writes go through the storage queue, so a bounded storage
/// applies backpressure here.
pub struct PacketStore<T> {
    name: String,
    storage: ChannelStorage<T>,
    project: Projection<T>,
}

impl<T> PacketStore<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        storage: ChannelStorage<T>,
        project: impl Fn(&Packet) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            project: Box::new(project),
        }
    }

    pub fn storage(&self) -> &ChannelStorage<T> {
        &self.storage
    }
}

impl PacketStore<Packet> {
    /// Store every packet as decoded.
    pub fn packets(storage: ChannelStorage<Packet>) -> Self {
        Self::new("packets", storage, |packet| Some(packet.clone()))
    }
}

impl PacketStore<String> {
    /// Store the text of command packets.
    pub fn commands(storage: ChannelStorage<String>) -> Self {
        Self::new("commands", storage, |packet| {
            packet.as_command().map(|c| c.text.clone())
        })
    }
}

impl<T> PacketConsumer for PacketStore<T>
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_packet<'a>(&'a self, packet: &'a Packet) -> BoxFuture<'a, Result<(), ConsumerError>> {
        Box::pin(async move {
            if let Some(item) = (self.project)(packet) {
                self.storage.write(item).await?;
            }
            Ok(())
        })
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.storage.dispose())
    }
}

impl<T> std::fmt::Debug for PacketStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStore")
            .field("name", &self.name)
            .field("storage", &self.storage)
            .finish()
    }
}
