//! Line-oriented ASCII protocol.
//!
//! Every packet is one `\n`-terminated line (`\r\n` is accepted on decode).
//! Structured reports:
//! ```text
//! [DATA]: 1.5, 0x10            -> channels CH0, CH1
//! [DATA]: T=21.5, P=1013       -> channels T, P
//! [DATA.iic]: 42               -> channel iic
//! [DATA.iic]: T=21.5, 7        -> channels iic.T, iic.CH1
//! [REG]: 0xAB                  -> reply to the pending register read
//! ```
//! Anything else is a command. A buffer starting with the binary start byte
//! is handed to the binary codec, so both protocols can share one link.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::binary::{BinaryCodec, BinaryCodecConfig, START_BYTE};
use crate::codec::{Codec, CodecState};
use crate::error::{CodecError, Result};
use crate::packet::{ChannelId, DataPacket, Packet, RegisterOperation, RegisterPacket};

/// Command words used to access one regfile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegfileCommands {
    pub write: String,
    pub read: String,
    pub bits_write: String,
    pub bits_read: String,
}

impl Default for RegfileCommands {
    fn default() -> Self {
        Self {
            write: "REG.W".to_string(),
            read: "REG.R".to_string(),
            bits_write: "REG.BW".to_string(),
            bits_read: "REG.BR".to_string(),
        }
    }
}

/// How register command arguments are wrapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapperStyle {
    /// `REG.W(10,AB);`
    #[default]
    Func,
    /// `REG.W;10;AB;`
    Semicolon,
}

impl WrapperStyle {
    fn delimiters(self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::Func => ("(", ",", ");"),
            Self::Semicolon => (";", ";", ";"),
        }
    }
}

/// Configuration for [`AsciiCodec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsciiCodecConfig {
    /// Codec for binary frames multiplexed onto the same link.
    pub binary: BinaryCodecConfig,
    /// Command words per regfile, indexed by regfile number.
    pub regfiles: Vec<RegfileCommands>,
    pub wrapper: WrapperStyle,
}

impl Default for AsciiCodecConfig {
    fn default() -> Self {
        Self {
            binary: BinaryCodecConfig::default(),
            regfiles: vec![RegfileCommands::default()],
            wrapper: WrapperStyle::default(),
        }
    }
}

/// Codec for the line-oriented ASCII protocol.
#[derive(Debug, Clone, Default)]
pub struct AsciiCodec {
    config: AsciiCodecConfig,
    binary: BinaryCodec,
}

impl AsciiCodec {
    pub fn new(config: AsciiCodecConfig) -> Self {
        let binary = BinaryCodec::new(config.binary.clone());
        Self { config, binary }
    }

    pub fn config(&self) -> &AsciiCodecConfig {
        &self.config
    }

    fn register_line(&self, register: &RegisterPacket) -> Result<String> {
        let commands = self
            .config
            .regfiles
            .get(register.regfile as usize)
            .ok_or_else(|| {
                CodecError::InvalidPacket(format!(
                    "no ASCII command set for regfile {}",
                    register.regfile
                ))
            })?;
        let (open, sep, close) = self.config.wrapper.delimiters();
        let RegisterPacket {
            address,
            start_bit,
            end_bit,
            value,
            ..
        } = *register;

        let line = match register.operation {
            RegisterOperation::Write => {
                format!("{}{open}{address:X}{sep}{value:X}{close}", commands.write)
            }
            RegisterOperation::ReadRequest => {
                format!("{}{open}{address:X}{close}", commands.read)
            }
            RegisterOperation::BitsWrite => format!(
                "{}{open}{address:X}{sep}{start_bit}{sep}{end_bit}{sep}{value:X}{close}",
                commands.bits_write
            ),
            RegisterOperation::BitsReadRequest => format!(
                "{}{open}{address:X}{sep}{start_bit}{sep}{end_bit}{close}",
                commands.bits_read
            ),
            RegisterOperation::ReadResult | RegisterOperation::BitsReadResult => {
                return Err(self.unsupported(&Packet::Register(*register)))
            }
        };
        Ok(line)
    }

    fn unsupported(&self, packet: &Packet) -> CodecError {
        CodecError::UnsupportedPacketKind {
            codec: self.name(),
            kind: packet.kind(),
        }
    }
}

impl Codec for AsciiCodec {
    fn name(&self) -> &'static str {
        "ascii"
    }

    fn encode(&self, packet: &Packet, state: &mut CodecState, dst: &mut BytesMut) -> Result<()> {
        match packet {
            Packet::Command(command) => {
                dst.put_slice(command.with_line_ending().as_bytes());
            }
            Packet::Register(register) => {
                let line = self.register_line(register)?;
                dst.reserve(line.len() + 1);
                dst.put_slice(line.as_bytes());
                dst.put_u8(b'\n');
                if register.operation.expects_reply() {
                    state.await_reply(*register);
                }
            }
            Packet::Data(_) => return Err(self.unsupported(packet)),
        }
        Ok(())
    }

    fn try_decode(&self, src: &mut BytesMut, state: &mut CodecState) -> Result<Option<Packet>> {
        match src.first() {
            None => return Ok(None),
            Some(&START_BYTE) => return self.binary.try_decode(src, state),
            Some(_) => {}
        }

        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let raw = src.split_to(newline + 1);
        let mut line = &raw[..newline];
        if let [rest @ .., b'\r'] = line {
            line = rest;
        }
        let line = String::from_utf8_lossy(line);

        if let Some(packet) = parse_report(&line, state) {
            return Ok(Some(packet));
        }
        Ok(Some(Packet::command(format!("{line}\n"))))
    }
}

/// Parse a `[KEY.prefix]: body` report. `None` means "treat as a command".
fn parse_report(line: &str, state: &mut CodecState) -> Option<Packet> {
    let rest = line.strip_prefix('[')?;
    let (header, after) = rest.split_once(']')?;
    let body = after.trim_start().strip_prefix(':')?.trim();

    let (key, prefix) = match header.split_once('.') {
        Some((key, prefix)) => (key.trim(), Some(prefix.trim()).filter(|p| !p.is_empty())),
        None => (header.trim(), None),
    };

    if key.eq_ignore_ascii_case("DATA") {
        parse_data(body, prefix).map(Packet::Data)
    } else if key.eq_ignore_ascii_case("REG") {
        parse_register_reply(body, state).map(Packet::Register)
    } else {
        None
    }
}

fn parse_data(body: &str, prefix: Option<&str>) -> Option<DataPacket> {
    let bare_single = !body.contains(',') && !body.contains('=');
    let mut channels = Vec::new();
    let mut values = Vec::new();

    for chunk in body.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let (label, token) = match chunk.split_once('=') {
            Some((label, token)) => (Some(label.trim()).filter(|l| !l.is_empty()), token.trim()),
            None => (None, chunk),
        };
        let Some(value) = parse_number(token) else {
            continue;
        };
        let base = match label {
            Some(label) => label.to_string(),
            None => format!("CH{}", values.len()),
        };
        let name = match prefix {
            Some(prefix) if bare_single => prefix.to_string(),
            Some(prefix) => format!("{prefix}.{base}"),
            None => base,
        };
        channels.push(ChannelId::Named(name));
        values.push(value);
    }

    if values.is_empty() {
        return None;
    }
    match DataPacket::from_f64_samples(channels, &values) {
        Ok(data) => Some(data),
        Err(e) => {
            debug!(error = %e, "data report rejected, passing through as command");
            None
        }
    }
}

fn parse_register_reply(body: &str, state: &mut CodecState) -> Option<RegisterPacket> {
    let request = *state.pending()?;
    let digits = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
        .unwrap_or(body);
    let value = u32::from_str_radix(digits, 16).ok()?;
    state.reset();
    request.reply_with(value)
}

/// Decimal, or hex with a `0x` prefix. Either may carry a sign.
fn parse_number(token: &str) -> Option<f64> {
    let (negative, unsigned) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        let magnitude = u64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -magnitude } else { magnitude });
    }
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}
