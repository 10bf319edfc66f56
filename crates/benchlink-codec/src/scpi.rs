//! Line protocol for SCPI bench instruments.
//!
//! Instruments answer queries with one line each. A line that is a single
//! number (`+1.234E-03`, `-5`, `0`) becomes a one-sample `float64` data
//! packet on channel `CH0`; any other line is a command.

use bytes::{BufMut, BytesMut};

use crate::codec::{Codec, CodecState};
use crate::error::{CodecError, Result};
use crate::packet::{ChannelId, DataPacket, Packet};

/// Channel name for numeric replies.
pub const REPLY_CHANNEL: &str = "CH0";

#[derive(Debug, Clone, Copy, Default)]
pub struct ScpiCodec;

impl Codec for ScpiCodec {
    fn name(&self) -> &'static str {
        "scpi"
    }

    fn encode(&self, packet: &Packet, _state: &mut CodecState, dst: &mut BytesMut) -> Result<()> {
        match packet {
            Packet::Command(command) => {
                dst.put_slice(command.with_line_ending().as_bytes());
                Ok(())
            }
            _ => Err(CodecError::UnsupportedPacketKind {
                codec: self.name(),
                kind: packet.kind(),
            }),
        }
    }

    fn try_decode(&self, src: &mut BytesMut, _state: &mut CodecState) -> Result<Option<Packet>> {
        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
            return Ok(None);
        };
        let raw = src.split_to(newline + 1);
        let line = String::from_utf8_lossy(&raw[..newline]);
        let line = line.trim_end_matches('\r');

        if let Some(value) = line.trim().parse::<f64>().ok().filter(|v| v.is_finite()) {
            let channels = vec![ChannelId::Named(REPLY_CHANNEL.into())];
            let data = DataPacket::from_f64_samples(channels, &[value])?;
            return Ok(Some(Packet::Data(data)));
        }
        Ok(Some(Packet::command(format!("{line}\n"))))
    }
}
