//! Typed application packets.
//!
//! Packets are immutable values. Codecs create them on decode and callers
//! create them to send; nothing holds a reference to a packet after it has
//! been handed on.

use std::collections::HashSet;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// One decoded (or to-be-encoded) application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Packet {
    Command(CommandPacket),
    Data(DataPacket),
    Register(RegisterPacket),
}

impl Packet {
    pub fn command(text: impl Into<String>) -> Self {
        Self::Command(CommandPacket::new(text))
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Command(_) => PacketKind::Command,
            Self::Data(_) => PacketKind::Data,
            Self::Register(_) => PacketKind::Register,
        }
    }

    pub fn as_command(&self) -> Option<&CommandPacket> {
        match self {
            Self::Command(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataPacket> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<&RegisterPacket> {
        match self {
            Self::Register(r) => Some(r),
            _ => None,
        }
    }
}

impl From<CommandPacket> for Packet {
    fn from(value: CommandPacket) -> Self {
        Self::Command(value)
    }
}

impl From<DataPacket> for Packet {
    fn from(value: DataPacket) -> Self {
        Self::Data(value)
    }
}

impl From<RegisterPacket> for Packet {
    fn from(value: RegisterPacket) -> Self {
        Self::Register(value)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(c) => write!(f, "{}", c.text.trim_end()),
            Self::Data(d) => write!(
                f,
                "{} x {} samples ({})",
                d.channels.len(),
                d.samples_per_channel(),
                d.element_type
            ),
            Self::Register(r) => write!(f, "{r}"),
        }
    }
}

/// Packet variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Command,
    Data,
    Register,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Command => "command",
            Self::Data => "data",
            Self::Register => "register",
        };
        f.write_str(s)
    }
}

/// A line-oriented ASCII instruction or reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPacket {
    pub text: String,
}

impl CommandPacket {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// The text with any trailing `\r\n` or `\n` replaced by a single `\n`.
    pub fn with_line_ending(&self) -> String {
        let body = self.text.trim_end_matches(['\r', '\n']);
        let mut line = String::with_capacity(body.len() + 1);
        line.push_str(body);
        line.push('\n');
        line
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Sample type of a data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    Float64,
}

impl ElementType {
    /// Size of one sample in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
        };
        f.write_str(s)
    }
}

/// How integer samples are represented. Ignored for `float64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Unsigned, zero at the bottom of the range.
    OffsetBinary,
    /// Signed two's complement.
    TwosComplement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    Little,
    Big,
}

/// Identifies one channel of a data stream.
///
/// Binary streams number their channels; ASCII reports name them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelId {
    Index(u16),
    Named(String),
}

impl ChannelId {
    pub fn index(&self) -> Option<u16> {
        match self {
            Self::Index(i) => Some(*i),
            Self::Named(_) => None,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<u16> for ChannelId {
    fn from(value: u16) -> Self {
        Self::Index(value)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::Named(value.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self::Named(value)
    }
}

/// A block of samples for one or more channels.
///
/// With one channel, `raw` is a flat array of samples. With `N > 1`
/// channels the samples are interleaved round-robin and `raw.len()` is a
/// multiple of `N * element_type.size()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    element_type: ElementType,
    encoding: Encoding,
    endianness: Endianness,
    channels: Vec<ChannelId>,
    raw: Bytes,
}

impl DataPacket {
    /// Build a data packet, checking the interleaving invariant and that
    /// channel ids are unique.
    pub fn new(
        element_type: ElementType,
        encoding: Encoding,
        endianness: Endianness,
        channels: Vec<ChannelId>,
        raw: impl Into<Bytes>,
    ) -> Result<Self> {
        let raw = raw.into();
        if channels.is_empty() {
            return Err(CodecError::InvalidPacket(
                "data packet needs at least one channel".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(channels.len());
        if let Some(dup) = channels.iter().find(|c| !seen.insert(*c)) {
            return Err(CodecError::InvalidPacket(format!(
                "duplicate channel id {dup}"
            )));
        }
        let stride = channels.len() * element_type.size();
        if raw.len() % stride != 0 {
            return Err(CodecError::InvalidPacket(format!(
                "{} bytes is not a multiple of {} channels x {} bytes",
                raw.len(),
                channels.len(),
                element_type.size()
            )));
        }
        Ok(Self {
            element_type,
            encoding,
            endianness,
            channels,
            raw,
        })
    }

    /// One little-endian `float64` sample per channel.
    pub fn from_f64_samples(channels: Vec<ChannelId>, values: &[f64]) -> Result<Self> {
        let mut raw = BytesMut::with_capacity(values.len() * 8);
        for v in values {
            raw.put_f64_le(*v);
        }
        Self::new(
            ElementType::Float64,
            Encoding::TwosComplement,
            Endianness::Little,
            channels,
            raw.freeze(),
        )
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.channels
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn is_interleaved(&self) -> bool {
        self.channels.len() > 1
    }

    pub fn samples_per_channel(&self) -> usize {
        self.raw.len() / (self.channels.len() * self.element_type.size())
    }

    /// All samples of `channel`, converted to `f64`.
    pub fn column(&self, channel: &ChannelId) -> Option<Vec<f64>> {
        let pos = self.channels.iter().position(|c| c == channel)?;
        let size = self.element_type.size();
        let stride = self.channels.len() * size;
        Some(
            self.raw
                .chunks_exact(stride)
                .map(|frame| self.sample(&frame[pos * size..(pos + 1) * size]))
                .collect(),
        )
    }

    /// Every channel paired with its samples, in channel order.
    pub fn columns(&self) -> Vec<(ChannelId, Vec<f64>)> {
        self.channels
            .iter()
            .filter_map(|c| self.column(c).map(|values| (c.clone(), values)))
            .collect()
    }

    fn sample(&self, bytes: &[u8]) -> f64 {
        let mut word = [0u8; 8];
        match self.endianness {
            Endianness::Little => word[..bytes.len()].copy_from_slice(bytes),
            Endianness::Big => {
                for (i, b) in bytes.iter().rev().enumerate() {
                    word[i] = *b;
                }
            }
        }
        let bits = u64::from_le_bytes(word);
        if self.element_type == ElementType::Float64 {
            return f64::from_bits(bits);
        }
        let width = bytes.len() as u32 * 8;
        match self.encoding {
            Encoding::OffsetBinary => bits as f64,
            Encoding::TwosComplement => {
                let shift = 64 - width;
                (((bits << shift) as i64) >> shift) as f64
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Register
// ---------------------------------------------------------------------------

/// What a register packet asks for or reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOperation {
    Write,
    ReadRequest,
    ReadResult,
    BitsWrite,
    BitsReadRequest,
    BitsReadResult,
}

impl RegisterOperation {
    /// Whether `start_bit`/`end_bit` are meaningful.
    pub const fn has_bit_range(self) -> bool {
        matches!(
            self,
            Self::BitsWrite | Self::BitsReadRequest | Self::BitsReadResult
        )
    }

    /// Whether the device answers this operation with a result.
    pub const fn expects_reply(self) -> bool {
        matches!(self, Self::ReadRequest | Self::BitsReadRequest)
    }

    pub const fn is_result(self) -> bool {
        matches!(self, Self::ReadResult | Self::BitsReadResult)
    }

    /// The result operation answering this request, if any.
    pub const fn reply_operation(self) -> Option<Self> {
        match self {
            Self::ReadRequest => Some(Self::ReadResult),
            Self::BitsReadRequest => Some(Self::BitsReadResult),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Write => "write",
            Self::ReadRequest => "read_request",
            Self::ReadResult => "read_result",
            Self::BitsWrite => "bits_write",
            Self::BitsReadRequest => "bits_read_request",
            Self::BitsReadResult => "bits_read_result",
        };
        f.write_str(s)
    }
}

/// Access to one device register, or to a bit range of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterPacket {
    pub operation: RegisterOperation,
    pub regfile: u32,
    pub address: u32,
    /// Only encoded for bit operations; codecs drop it otherwise and
    /// decode it as 0.
    pub start_bit: u32,
    /// See `start_bit`.
    pub end_bit: u32,
    pub value: u32,
}

impl RegisterPacket {
    pub fn write(regfile: u32, address: u32, value: u32) -> Self {
        Self {
            operation: RegisterOperation::Write,
            regfile,
            address,
            start_bit: 0,
            end_bit: 0,
            value,
        }
    }

    pub fn read_request(regfile: u32, address: u32) -> Self {
        Self {
            operation: RegisterOperation::ReadRequest,
            ..Self::write(regfile, address, 0)
        }
    }

    pub fn bits_write(
        regfile: u32,
        address: u32,
        start_bit: u32,
        end_bit: u32,
        value: u32,
    ) -> Self {
        Self {
            operation: RegisterOperation::BitsWrite,
            regfile,
            address,
            start_bit,
            end_bit,
            value,
        }
    }

    pub fn bits_read_request(regfile: u32, address: u32, start_bit: u32, end_bit: u32) -> Self {
        Self {
            operation: RegisterOperation::BitsReadRequest,
            ..Self::bits_write(regfile, address, start_bit, end_bit, 0)
        }
    }

    /// The result packet answering this request with `value`.
    ///
    /// Returns `None` for operations that expect no reply.
    pub fn reply_with(&self, value: u32) -> Option<Self> {
        let operation = self.operation.reply_operation()?;
        Some(Self {
            operation,
            value,
            ..*self
        })
    }

    pub fn with_value(self, value: u32) -> Self {
        Self { value, ..self }
    }
}

impl fmt::Display for RegisterPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "REG{}.{:#X}", self.regfile, self.address)?;
        if self.operation.has_bit_range() {
            write!(f, ".{}:{}", self.start_bit, self.end_bit)?;
        }
        match self.operation {
            RegisterOperation::Write | RegisterOperation::BitsWrite => {
                write!(f, ".WRITE={:#X}", self.value)
            }
            RegisterOperation::ReadRequest | RegisterOperation::BitsReadRequest => {
                f.write_str(".READ?")
            }
            RegisterOperation::ReadResult | RegisterOperation::BitsReadResult => {
                write!(f, "={:#X}", self.value)
            }
        }
    }
}
