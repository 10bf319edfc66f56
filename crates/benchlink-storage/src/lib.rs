//! In-process storage for decoded packets.
//!
//! [`ChannelStorage`] absorbs bursts from a producer through a bounded or
//! unbounded queue while a background task drains the queue in batches into
//! an append-only, randomly indexable log. The bounded queue is the one
//! intentional backpressure point of a session: a full queue suspends the
//! writer, never the decoder feeding it.

pub mod channel;
pub mod error;

pub use channel::{ChannelStorage, StorageConfig, StorageReader, DEFAULT_BATCH_SIZE};
pub use error::{Result, StorageError};
