//! Packet model and wire codecs for instrument links.
//!
//! A [`Codec`] turns typed [`Packet`]s into bytes and pulls complete packets
//! back out of a byte buffer that fills up in arbitrary chunks:
//! - [`BinaryCodec`]: fixed-length frames bounded by `0x3C`/`0x3E`, with the
//!   frame length selected by the protocol id
//! - [`AsciiCodec`]: newline-terminated text with `[DATA]` and `[REG]`
//!   reports, handing any frame that starts with `0x3C` to the binary codec
//! - [`ScpiCodec`]: newline-terminated replies from bench instruments
//!
//! Register read correlation lives in an explicit [`CodecState`] the caller
//! passes alongside the buffer, so codecs themselves hold no mutable state.

pub mod ascii;
pub mod binary;
pub mod codec;
pub mod crc;
pub mod error;
#[cfg(feature = "async")]
pub mod framed;
pub mod packet;
pub mod scpi;

pub use ascii::{AsciiCodec, AsciiCodecConfig, RegfileCommands, WrapperStyle};
pub use binary::{BinaryCodec, BinaryCodecConfig, CrcMode, FrameSize, END_BYTE, START_BYTE};
pub use codec::{Codec, CodecState};
pub use error::{CodecError, FrameFault, Result};
#[cfg(feature = "async")]
pub use framed::PacketFramer;
pub use packet::{
    ChannelId, CommandPacket, DataPacket, ElementType, Encoding, Endianness, Packet, PacketKind,
    RegisterOperation, RegisterPacket,
};
pub use scpi::ScpiCodec;
