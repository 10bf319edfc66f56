//! Session pipeline for instrument links.
//!
//! A [`Session`] owns one [`Transport`](benchlink_transport::Transport) and
//! one [`Codec`](benchlink_codec::Codec). Bytes read from the transport are
//! appended to an intermediate buffer, decoded into packets in arrival
//! order, and handed to every registered [`PacketConsumer`] in registration
//! order. Reads and writes are single-flight: a second concurrent call fails
//! fast with [`SessionError::ConcurrentOperation`] instead of interleaving
//! bytes on the wire.
//!
//! ```ignore
//! let storage = ChannelStorage::unbounded();
//! let session = SessionBuilder::new(transport, AsciiCodec::default())
//!     .consumer(PacketStore::commands(storage.clone()))
//!     .polling(DEFAULT_POLL_INTERVAL)
//!     .build()?;
//!
//! session.send_command("*IDN?").await?;
//! ```

pub mod config;
pub mod consumer;
mod dispatch;
pub mod error;
mod guard;
pub mod pool;
pub mod session;

pub use config::{SessionConfig, DEFAULT_POLL_INTERVAL};
pub use consumer::{BoxFuture, ConsumerError, PacketConsumer, PacketStore, TracingLogger};
pub use error::{Operation, Result, SessionError};
pub use pool::{BufferPool, PooledBuffer};
pub use session::{Session, SessionBuilder, SessionStats};
