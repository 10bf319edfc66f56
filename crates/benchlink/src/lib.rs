//! Host-side framework for talking to bench instruments.
//!
//! A session reads bytes from a transport, decodes them into packets with a
//! protocol codec, and hands each packet to its consumers in order.
//!
//! # Crate Structure
//!
//! - [`transport`]: transport contract, loopback ring and async-stream adapter
//! - [`codec`]: packet model plus the binary, ASCII and SCPI line codecs
//! - [`storage`]: channel-backed append-only storage with independent readers
//! - [`session`]: read/decode/dispatch pipeline, polling and consumers

/// Re-export transport types.
pub mod transport {
    pub use benchlink_transport::*;
}

/// Re-export codec types.
pub mod codec {
    pub use benchlink_codec::*;
}

/// Re-export storage types.
pub mod storage {
    pub use benchlink_storage::*;
}

/// Re-export session types.
pub mod session {
    pub use benchlink_session::*;
}
