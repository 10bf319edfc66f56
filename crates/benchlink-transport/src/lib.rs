//! Duplex byte-channel abstraction for instrument links.
//!
//! Everything above this layer talks to a device through the [`Transport`]
//! contract: connect, disconnect, read a chunk, write a chunk, and report
//! cumulative byte counters. Two implementations ship here:
//! - [`LoopbackTransport`], a fixed-capacity circular buffer used as the
//!   reference device for correctness and throughput testing
//! - [`StreamTransport`], an adapter over any `AsyncRead + AsyncWrite`
//!   stream (serial port crates, sockets, in-memory duplex pipes)
//!
//! Hardware that pushes bytes on its own (interrupt-driven FIFOs) also
//! implements [`EventCapableTransport`], which hands out a channel of
//! timestamped byte events.

pub mod error;
pub mod loopback;
pub mod stream;
pub mod traits;

pub use error::{Result, TransportError};
pub use loopback::{LoopbackConfig, LoopbackTransport, DEFAULT_CAPACITY};
pub use stream::{StreamConfig, StreamTransport};
pub use traits::{EventCapableTransport, Transport, TransportEvent};
