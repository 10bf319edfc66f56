use crate::packet::PacketKind;

/// Why a frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameFault {
    /// The buffer does not begin with the frame start byte.
    #[error("expected start byte 0x3C, found {0:#04x}")]
    StartByte(u8),

    /// The protocol id does not name a known frame type.
    #[error("unknown protocol id {0:#04x}")]
    UnknownProtocolId(u8),

    /// The byte at the end of the fixed-length frame is not the end byte.
    #[error("expected end byte 0x3E, found {0:#04x}")]
    EndByte(u8),

    /// The declared payload length does not fit the frame.
    #[error("payload length {declared} exceeds frame capacity {max}")]
    PayloadLength { declared: usize, max: usize },

    /// A register payload is neither the 16 nor the 24 byte layout.
    #[error("register payload of {0} bytes")]
    RegisterLength(usize),

    /// A register payload carries an unknown operation word.
    #[error("unknown register operation {0:#x}")]
    RegisterOperation(u32),

    /// A data payload does not fit its declared layout.
    #[error("data payload: {0}")]
    DataLayout(String),
}

/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The stream is desynchronized. Fatal for the connection.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameFault),

    /// The codec has no wire representation for this packet variant.
    #[error("{codec} codec cannot encode {kind} packets")]
    UnsupportedPacketKind {
        codec: &'static str,
        kind: PacketKind,
    },

    /// The packet is valid but uses a format this codec cannot carry.
    #[error("unsupported data format: {0}")]
    UnsupportedDataFormat(String),

    /// The payload exceeds the largest frame available.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A packet violates the packet model's invariants.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// An I/O error surfaced through a framed stream.
    #[error("codec I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the error leaves the byte stream unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedFrame(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
