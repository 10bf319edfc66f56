use std::fs;

use benchlink_codec::{
    AsciiCodec, BinaryCodec, Codec, CodecError, CodecState, Packet, ScpiCodec,
};
use bytes::BytesMut;
use tracing::warn;

use crate::cmd::{CodecKind, DecodeArgs};
use crate::exit::{codec_error, io_error, CliResult, SUCCESS};
use crate::output::{parse_hex, print_packets, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let input = match (&args.hex, &args.file) {
        (Some(hex), _) => parse_hex(hex)?,
        (None, Some(path)) => fs::read(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?,
        (None, None) => Vec::new(),
    };

    let decoded = match args.codec {
        CodecKind::Binary => decode_with(&BinaryCodec::default(), &input),
        CodecKind::Ascii => decode_with(&AsciiCodec::default(), &input),
        CodecKind::Scpi => decode_with(&ScpiCodec, &input),
    };

    print_packets(&decoded.packets, format);
    if let Some(err) = decoded.error {
        return Err(codec_error(
            &format!("decode stopped after {} packets", decoded.packets.len()),
            err,
        ));
    }
    if decoded.trailing > 0 {
        warn!(bytes = decoded.trailing, "input ends with an incomplete packet");
    }
    Ok(SUCCESS)
}

struct Decoded {
    packets: Vec<Packet>,
    error: Option<CodecError>,
    trailing: usize,
}

/// Decode everything in `input`, keeping the packets that precede a
/// malformed frame.
fn decode_with<C: Codec>(codec: &C, input: &[u8]) -> Decoded {
    let mut buf = BytesMut::from(input);
    let mut state = CodecState::default();
    let mut packets = Vec::new();
    let error = loop {
        match codec.try_decode(&mut buf, &mut state) {
            Ok(Some(packet)) => packets.push(packet),
            Ok(None) => break None,
            Err(err) => break Some(err),
        }
    };
    Decoded {
        packets,
        error,
        trailing: buf.len(),
    }
}

#[cfg(test)]
mod tests {
    use benchlink_codec::START_BYTE;

    use super::*;

    #[test]
    fn decodes_ascii_lines_and_keeps_partial_tail() {
        let decoded = decode_with(&AsciiCodec::default(), b"*IDN?\r\nOK\nPART");
        assert_eq!(
            decoded.packets,
            vec![Packet::command("*IDN?\n"), Packet::command("OK\n")]
        );
        assert!(decoded.error.is_none());
        assert_eq!(decoded.trailing, 4);
    }

    #[test]
    fn stops_at_malformed_frame() {
        let mut input = b"OK\n".to_vec();
        input.extend_from_slice(&[START_BYTE, 0x7F]);
        let decoded = decode_with(&AsciiCodec::default(), &input);
        assert_eq!(decoded.packets, vec![Packet::command("OK\n")]);
        assert!(matches!(decoded.error, Some(CodecError::MalformedFrame(_))));
        assert_eq!(decoded.trailing, 2);
    }

    #[test]
    fn scpi_numeric_reply_is_data() {
        let decoded = decode_with(&ScpiCodec, b"1.25\n");
        assert!(decoded.packets[0].as_data().is_some());
    }
}
