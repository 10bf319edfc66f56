//! `tokio_util::codec` adapter.
//!
//! Wraps any [`Codec`] together with its [`CodecState`] so it can drive a
//! `Framed`, `FramedRead` or `FramedWrite` directly over an async stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{Codec, CodecState};
use crate::error::CodecError;
use crate::packet::Packet;

#[derive(Debug, Clone, Default)]
pub struct PacketFramer<C> {
    codec: C,
    state: CodecState,
}

impl<C: Codec> PacketFramer<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            state: CodecState::default(),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn state(&self) -> &CodecState {
        &self.state
    }
}

impl<C: Codec> Decoder for PacketFramer<C> {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.codec.try_decode(src, &mut self.state)
    }
}

impl<C: Codec> Encoder<Packet> for PacketFramer<C> {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.codec.encode(&item, &mut self.state, dst)
    }
}
