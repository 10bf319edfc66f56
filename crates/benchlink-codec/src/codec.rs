use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::packet::{Packet, RegisterPacket};

/// Register read correlation carried between `encode` and `try_decode`.
///
/// Text protocols answer a register read with a bare value, so the codec
/// needs to know which request the value belongs to. The state lives with
/// the connection, not in the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CodecState {
    #[default]
    Idle,
    AwaitingRegisterReply(RegisterPacket),
}

impl CodecState {
    /// Remember `request` as the one the next register reply answers.
    pub fn await_reply(&mut self, request: RegisterPacket) {
        *self = Self::AwaitingRegisterReply(request);
    }

    pub fn pending(&self) -> Option<&RegisterPacket> {
        match self {
            Self::Idle => None,
            Self::AwaitingRegisterReply(request) => Some(request),
        }
    }

    /// Clear the pending request, returning it.
    pub fn take_pending(&mut self) -> Option<RegisterPacket> {
        match std::mem::take(self) {
            Self::Idle => None,
            Self::AwaitingRegisterReply(request) => Some(request),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::Idle;
    }
}

/// A wire protocol.
///
/// `try_decode` returns `Ok(None)` and leaves `src` untouched until a whole
/// packet is buffered; on success it consumes exactly that packet's bytes.
/// Feeding a stream in any chunking yields the same packets in the same
/// order.
pub trait Codec: Send + Sync + 'static {
    /// Short protocol name used in errors and log output.
    fn name(&self) -> &'static str;

    /// Append the wire form of `packet` to `dst`.
    fn encode(&self, packet: &Packet, state: &mut CodecState, dst: &mut BytesMut) -> Result<()>;

    /// Pull the next complete packet out of `src`.
    fn try_decode(&self, src: &mut BytesMut, state: &mut CodecState) -> Result<Option<Packet>>;

    /// Encode `packet` into a fresh buffer.
    fn encode_to_bytes(&self, packet: &Packet, state: &mut CodecState) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode(packet, state, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Decode every complete packet currently buffered.
    fn decode_all(&self, src: &mut BytesMut, state: &mut CodecState) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        while let Some(packet) = self.try_decode(src, state)? {
            packets.push(packet);
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_take_clears() {
        let mut state = CodecState::default();
        assert!(state.pending().is_none());

        let request = RegisterPacket::read_request(0, 0x10);
        state.await_reply(request);
        assert_eq!(state.pending(), Some(&request));
        assert_eq!(state.take_pending(), Some(request));
        assert_eq!(state, CodecState::Idle);
    }

    #[test]
    fn test_newer_request_replaces_pending() {
        let mut state = CodecState::default();
        state.await_reply(RegisterPacket::read_request(0, 1));
        state.await_reply(RegisterPacket::read_request(0, 2));
        assert_eq!(state.pending().map(|r| r.address), Some(2));

        state.reset();
        assert!(state.pending().is_none());
    }
}
