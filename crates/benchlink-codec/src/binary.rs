//! Fixed-length binary frames.
//!
//! Wire format (`N` is fixed by the protocol id):
//! ```text
//! ┌───────┬──────────┬────────────────────────┬───────────┬─────────────┬────────┬───────┐
//! │ Start │ Protocol │ Control                │ Length    │ Payload     │ CRC    │ End   │
//! │ 0x3C  │ id (1B)  │ stream, flags-lo, -hi  │ (2B LE)   │ zero-padded │ (2B LE)│ 0x3E  │
//! │ [0]   │ [1]      │ [2..5]                 │ [5..7]    │ [7..N-3]    │[N-3..] │ [N-1] │
//! └───────┴──────────┴────────────────────────┴───────────┴─────────────┴────────┴───────┘
//! ```
//!
//! | id | frame | N |
//! |---|---|---|
//! | `0x31` `0x32` `0x33` | command | 64 / 256 / 2048 |
//! | `0x41` `0x42` `0x43` | data | 74 / 266 / 2058 |
//! | `0xA0` | register request | 256 |
//! | `0xA8` | register reply | 256 |
//!
//! The length field counts only the meaningful payload bytes. The CRC is
//! written on encode and never checked on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codec::{Codec, CodecState};
use crate::crc::crc16_ccitt;
use crate::error::{CodecError, FrameFault, Result};
use crate::packet::{
    ChannelId, DataPacket, ElementType, Encoding, Endianness, Packet, RegisterOperation,
    RegisterPacket,
};

/// First byte of every binary frame.
pub const START_BYTE: u8 = 0x3C;

/// Last byte of every binary frame.
pub const END_BYTE: u8 = 0x3E;

/// Start + protocol id + control (3) + length (2).
pub const HEADER_LEN: usize = 7;

/// Header plus CRC (2) and end byte.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 3;

/// Register frames are always 256 bytes.
pub const REGISTER_FRAME_LEN: usize = 256;

const REGISTER_REQUEST_ID: u8 = 0xA0;
const REGISTER_REPLY_ID: u8 = 0xA8;

const PLACEHOLDER_CRC: u16 = 0xCCCC;

const FLAG_INTERLEAVED: u8 = 0b0000_0001;
const FLAG_BIG_ENDIAN: u8 = 0b0000_0010;
const FLAG_TWOS_COMPLEMENT: u8 = 0b0000_0100;
const WIDTH_SHIFT: u8 = 3;
const WIDTH_MASK: u8 = 0b11;

/// Interleaved channel masks are 16 bits wide.
const MAX_INTERLEAVED_CHANNELS: u16 = 16;

const OP_WRITE: u32 = 0x00;
const OP_READ: u32 = 0x01;
const OP_BITS_WRITE: u32 = 0x10;
const OP_BITS_READ: u32 = 0x11;

/// Size class of command and data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSize {
    /// 64-byte class.
    Small,
    /// 256-byte class.
    Medium,
    /// 2048-byte class.
    Large,
}

impl FrameSize {
    const ALL: [FrameSize; 3] = [FrameSize::Small, FrameSize::Medium, FrameSize::Large];

    pub const fn bytes(self) -> usize {
        match self {
            Self::Small => 64,
            Self::Medium => 256,
            Self::Large => 2048,
        }
    }

    const fn command_id(self) -> u8 {
        match self {
            Self::Small => 0x31,
            Self::Medium => 0x32,
            Self::Large => 0x33,
        }
    }

    const fn data_id(self) -> u8 {
        match self {
            Self::Small => 0x41,
            Self::Medium => 0x42,
            Self::Large => 0x43,
        }
    }
}

/// What goes into the CRC field on encode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrcMode {
    /// CRC-16/CCITT-FALSE over bytes `1..N-3`, little-endian.
    #[default]
    Ccitt,
    /// The fixed filler `0xCCCC`, for firmware that expects it.
    Placeholder,
}

/// Configuration for [`BinaryCodec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryCodecConfig {
    /// Smallest frame class used for commands. Larger payloads step up.
    pub command_frame: FrameSize,
    /// Smallest frame class used for data. Larger payloads step up.
    pub data_frame: FrameSize,
    pub crc: CrcMode,
}

impl Default for BinaryCodecConfig {
    fn default() -> Self {
        Self {
            command_frame: FrameSize::Medium,
            data_frame: FrameSize::Medium,
            crc: CrcMode::Ccitt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Command,
    Data,
    Register { reply: bool },
}

/// Frame kind and total length for a protocol id.
fn frame_layout(id: u8) -> Option<(FrameKind, usize)> {
    FrameSize::ALL
        .iter()
        .find_map(|size| {
            if size.command_id() == id {
                Some((FrameKind::Command, size.bytes()))
            } else if size.data_id() == id {
                Some((FrameKind::Data, size.bytes() + FRAME_OVERHEAD))
            } else {
                None
            }
        })
        .or(match id {
            REGISTER_REQUEST_ID => Some((FrameKind::Register { reply: false }, REGISTER_FRAME_LEN)),
            REGISTER_REPLY_ID => Some((FrameKind::Register { reply: true }, REGISTER_FRAME_LEN)),
            _ => None,
        })
}

/// Codec for the fixed-length binary frame protocol.
#[derive(Debug, Clone, Default)]
pub struct BinaryCodec {
    config: BinaryCodecConfig,
}

impl BinaryCodec {
    pub fn new(config: BinaryCodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BinaryCodecConfig {
        &self.config
    }

    /// Smallest frame class at or above `min` whose payload area holds
    /// `len` bytes.
    fn fit(min: FrameSize, len: usize, capacity: impl Fn(FrameSize) -> usize) -> Result<FrameSize> {
        FrameSize::ALL
            .into_iter()
            .filter(|size| *size >= min)
            .find(|size| capacity(*size) >= len)
            .ok_or(CodecError::PayloadTooLarge {
                size: len,
                max: capacity(FrameSize::Large),
            })
    }

    fn write_frame(
        &self,
        dst: &mut BytesMut,
        id: u8,
        control: [u8; 3],
        payload: &[u8],
        frame_len: usize,
    ) {
        let start = dst.len();
        dst.reserve(frame_len);
        dst.put_u8(START_BYTE);
        dst.put_u8(id);
        dst.put_slice(&control);
        dst.put_u16_le(payload.len() as u16);
        dst.put_slice(payload);
        dst.put_bytes(0, frame_len - FRAME_OVERHEAD - payload.len());
        let crc = match self.config.crc {
            CrcMode::Ccitt => crc16_ccitt(&dst[start + 1..]),
            CrcMode::Placeholder => PLACEHOLDER_CRC,
        };
        dst.put_u16_le(crc);
        dst.put_u8(END_BYTE);
    }
}

impl Codec for BinaryCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn encode(&self, packet: &Packet, state: &mut CodecState, dst: &mut BytesMut) -> Result<()> {
        match packet {
            Packet::Command(command) => {
                let payload = command.text.as_bytes();
                let size = Self::fit(self.config.command_frame, payload.len(), |s| {
                    s.bytes() - FRAME_OVERHEAD
                })?;
                self.write_frame(dst, size.command_id(), [0; 3], payload, size.bytes());
            }
            Packet::Data(data) => {
                let control = data_control(data)?;
                let size = Self::fit(self.config.data_frame, data.raw().len(), FrameSize::bytes)?;
                self.write_frame(
                    dst,
                    size.data_id(),
                    control,
                    data.raw(),
                    size.bytes() + FRAME_OVERHEAD,
                );
            }
            Packet::Register(register) => {
                let id = if register.operation.is_result() {
                    REGISTER_REPLY_ID
                } else {
                    REGISTER_REQUEST_ID
                };
                let payload = register_payload(register);
                self.write_frame(dst, id, [0; 3], &payload, REGISTER_FRAME_LEN);
                if register.operation.expects_reply() {
                    state.await_reply(*register);
                }
            }
        }
        Ok(())
    }

    fn try_decode(&self, src: &mut BytesMut, state: &mut CodecState) -> Result<Option<Packet>> {
        match src.first() {
            None => return Ok(None),
            Some(&b) if b != START_BYTE => return Err(FrameFault::StartByte(b).into()),
            Some(_) => {}
        }
        if src.len() < 2 {
            return Ok(None);
        }

        let id = src[1];
        let (kind, frame_len) = frame_layout(id).ok_or(FrameFault::UnknownProtocolId(id))?;
        if src.len() < frame_len {
            return Ok(None);
        }

        let end = src[frame_len - 1];
        if end != END_BYTE {
            return Err(FrameFault::EndByte(end).into());
        }

        let declared = u16::from_le_bytes([src[5], src[6]]) as usize;
        let max = frame_len - FRAME_OVERHEAD;
        if declared > max {
            return Err(FrameFault::PayloadLength { declared, max }.into());
        }

        let control = [src[2], src[3], src[4]];
        let payload = &src[HEADER_LEN..HEADER_LEN + declared];
        let packet = match kind {
            FrameKind::Command => {
                Packet::command(String::from_utf8_lossy(payload).into_owned())
            }
            FrameKind::Data => Packet::Data(decode_data(control, payload)?),
            FrameKind::Register { reply } => {
                let register = decode_register(payload, reply)?;
                if register.operation.is_result() {
                    state.reset();
                }
                Packet::Register(register)
            }
        };

        src.advance(frame_len);
        trace!(id = format_args!("{id:#04x}"), frame_len, "binary frame decoded");
        Ok(Some(packet))
    }
}

fn data_control(data: &DataPacket) -> Result<[u8; 3]> {
    let width: u8 = match data.element_type() {
        ElementType::Int32 => 0,
        ElementType::Int16 => 1,
        ElementType::Int8 => 2,
        ElementType::Int64 => 3,
        ElementType::Float64 => {
            return Err(CodecError::UnsupportedDataFormat(
                "float64 samples have no binary frame encoding".to_string(),
            ))
        }
    };
    let mut high = width << WIDTH_SHIFT;
    if data.endianness() == Endianness::Big {
        high |= FLAG_BIG_ENDIAN;
    }
    if data.encoding() == Encoding::TwosComplement {
        high |= FLAG_TWOS_COMPLEMENT;
    }

    let indices = data
        .channels()
        .iter()
        .map(|c| {
            c.index().ok_or_else(|| {
                CodecError::UnsupportedDataFormat(format!(
                    "named channel {c} has no binary frame encoding"
                ))
            })
        })
        .collect::<Result<Vec<u16>>>()?;

    if let [single] = indices[..] {
        let stream_id = u8::try_from(single).map_err(|_| {
            CodecError::UnsupportedDataFormat(format!("channel {single} exceeds stream id range"))
        })?;
        return Ok([stream_id, 0, high]);
    }

    let mut mask: u16 = 0;
    let mut previous: Option<u16> = None;
    for index in indices {
        if index >= MAX_INTERLEAVED_CHANNELS {
            return Err(CodecError::UnsupportedDataFormat(format!(
                "interleaved channel {index} exceeds 16-bit channel mask"
            )));
        }
        if previous.is_some_and(|p| index <= p) {
            return Err(CodecError::UnsupportedDataFormat(
                "interleaved channels must be in ascending order".to_string(),
            ));
        }
        mask |= 1 << index;
        previous = Some(index);
    }
    Ok([(mask & 0xFF) as u8, (mask >> 8) as u8, high | FLAG_INTERLEAVED])
}

fn decode_data(control: [u8; 3], payload: &[u8]) -> Result<DataPacket> {
    let [stream_id, flags_low, flags_high] = control;
    let element_type = match (flags_high >> WIDTH_SHIFT) & WIDTH_MASK {
        0 => ElementType::Int32,
        1 => ElementType::Int16,
        2 => ElementType::Int8,
        _ => ElementType::Int64,
    };
    let endianness = if flags_high & FLAG_BIG_ENDIAN != 0 {
        Endianness::Big
    } else {
        Endianness::Little
    };
    let encoding = if flags_high & FLAG_TWOS_COMPLEMENT != 0 {
        Encoding::TwosComplement
    } else {
        Encoding::OffsetBinary
    };

    let channels: Vec<ChannelId> = if flags_high & FLAG_INTERLEAVED != 0 {
        let mask = (flags_low as u16) << 8 | stream_id as u16;
        (0..MAX_INTERLEAVED_CHANNELS)
            .filter(|bit| mask & (1 << bit) != 0)
            .map(ChannelId::Index)
            .collect()
    } else {
        vec![ChannelId::Index(stream_id as u16)]
    };
    if channels.is_empty() {
        return Err(FrameFault::DataLayout("empty channel mask".to_string()).into());
    }

    DataPacket::new(
        element_type,
        encoding,
        endianness,
        channels,
        Bytes::copy_from_slice(payload),
    )
    .map_err(|e| FrameFault::DataLayout(e.to_string()).into())
}

fn register_payload(register: &RegisterPacket) -> BytesMut {
    let word = match register.operation {
        RegisterOperation::Write => OP_WRITE,
        RegisterOperation::ReadRequest | RegisterOperation::ReadResult => OP_READ,
        RegisterOperation::BitsWrite => OP_BITS_WRITE,
        RegisterOperation::BitsReadRequest | RegisterOperation::BitsReadResult => OP_BITS_READ,
    };
    let mut payload = BytesMut::with_capacity(24);
    payload.put_u32_le(word);
    payload.put_u32_le(register.regfile);
    payload.put_u32_le(register.address);
    if register.operation.has_bit_range() {
        payload.put_u32_le(register.start_bit);
        payload.put_u32_le(register.end_bit);
    }
    payload.put_u32_le(register.value);
    payload
}

fn decode_register(mut payload: &[u8], reply: bool) -> Result<RegisterPacket> {
    let with_bits = match payload.len() {
        16 => false,
        24 => true,
        n => return Err(FrameFault::RegisterLength(n).into()),
    };
    let word = payload.get_u32_le();
    let operation = match (word, reply) {
        (OP_WRITE, _) => RegisterOperation::Write,
        (OP_READ, false) => RegisterOperation::ReadRequest,
        (OP_READ, true) => RegisterOperation::ReadResult,
        (OP_BITS_WRITE, _) => RegisterOperation::BitsWrite,
        (OP_BITS_READ, false) => RegisterOperation::BitsReadRequest,
        (OP_BITS_READ, true) => RegisterOperation::BitsReadResult,
        (other, _) => return Err(FrameFault::RegisterOperation(other).into()),
    };
    let regfile = payload.get_u32_le();
    let address = payload.get_u32_le();
    let (start_bit, end_bit) = if with_bits {
        (payload.get_u32_le(), payload.get_u32_le())
    } else {
        (0, 0)
    };
    let value = payload.get_u32_le();
    Ok(RegisterPacket {
        operation,
        regfile,
        address,
        start_bit,
        end_bit,
        value,
    })
}
