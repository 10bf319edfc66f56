use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Poll interval used when none is given.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(15);

/// Default largest undecoded backlog: 16 MiB.
pub const DEFAULT_MAX_PENDING: usize = 16 * 1024 * 1024;

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bytes requested from the transport per read. Default: 4096.
    pub read_chunk_size: usize,
    /// Read buffers kept in the session's pool. Default: 4.
    pub pool_slots: usize,
    /// Packets buffered per `subscribe` receiver before it lags. Default: 1024.
    pub broadcast_capacity: usize,
    /// Undecoded bytes allowed to pile up before reads fail. Default: 16 MiB.
    pub max_pending: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 4096,
            pool_slots: 4,
            broadcast_capacity: 1024,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl SessionConfig {
    /// Clamp zero sizes to the smallest usable value.
    pub fn validated(mut self) -> Self {
        self.read_chunk_size = self.read_chunk_size.max(1);
        self.pool_slots = self.pool_slots.max(1);
        self.broadcast_capacity = self.broadcast_capacity.max(1);
        self
    }
}
