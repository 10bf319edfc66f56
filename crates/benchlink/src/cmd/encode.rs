use benchlink_codec::{
    AsciiCodec, BinaryCodec, BinaryCodecConfig, Codec, CodecState, CrcMode, FrameSize, Packet,
    RegisterOperation, RegisterPacket, ScpiCodec,
};

use crate::cmd::{CodecKind, EncodeArgs, FrameArg};
use crate::exit::{codec_error, CliError, CliResult, SUCCESS};
use crate::output::{print_encoded, OutputFormat};

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let packet = match (&args.command, &args.register) {
        (Some(text), None) => Packet::command(text.as_str()),
        (None, Some(spec)) => Packet::Register(parse_register(spec)?),
        _ => return Err(CliError::usage("exactly one of --command or --register is required")),
    };

    let (name, bytes) = match args.codec {
        CodecKind::Binary => {
            let codec = BinaryCodec::new(BinaryCodecConfig {
                command_frame: frame_size(args.frame),
                crc: if args.placeholder_crc {
                    CrcMode::Placeholder
                } else {
                    CrcMode::Ccitt
                },
                ..Default::default()
            });
            encode_with(&codec, &packet)?
        }
        CodecKind::Ascii => encode_with(&AsciiCodec::default(), &packet)?,
        CodecKind::Scpi => encode_with(&ScpiCodec, &packet)?,
    };

    print_encoded(name, &bytes, format);
    Ok(SUCCESS)
}

fn encode_with<C: Codec>(codec: &C, packet: &Packet) -> CliResult<(&'static str, Vec<u8>)> {
    let bytes = codec
        .encode_to_bytes(packet, &mut CodecState::default())
        .map_err(|err| codec_error("encode failed", err))?;
    Ok((codec.name(), bytes.to_vec()))
}

fn frame_size(frame: FrameArg) -> FrameSize {
    match frame {
        FrameArg::Small => FrameSize::Small,
        FrameArg::Medium => FrameSize::Medium,
        FrameArg::Large => FrameSize::Large,
    }
}

/// Parse `OP:REGFILE:ADDRESS[:START:END][:VALUE]`.
fn parse_register(spec: &str) -> CliResult<RegisterPacket> {
    let mut parts = spec.split(':');
    let op = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
    let fields = parts.map(parse_number).collect::<CliResult<Vec<u32>>>()?;

    let operation = match op.as_str() {
        "w" | "write" => RegisterOperation::Write,
        "r" | "read" => RegisterOperation::ReadRequest,
        "wr" | "result" => RegisterOperation::ReadResult,
        "bw" | "bits-write" => RegisterOperation::BitsWrite,
        "br" | "bits-read" => RegisterOperation::BitsReadRequest,
        "bwr" | "bits-result" => RegisterOperation::BitsReadResult,
        other => {
            return Err(CliError::usage(format!(
                "unknown register operation: {other}"
            )))
        }
    };

    let bit_fields = if operation.has_bit_range() { 2 } else { 0 };
    let value_fields = usize::from(!operation.expects_reply());
    let expected = 2 + bit_fields + value_fields;
    if fields.len() != expected {
        return Err(CliError::usage(format!(
            "register {operation} takes {expected} fields after the operation, got {}",
            fields.len()
        )));
    }

    let (start_bit, end_bit) = if bit_fields == 2 {
        (fields[2], fields[3])
    } else {
        (0, 0)
    };
    let value = if value_fields == 1 {
        fields[expected - 1]
    } else {
        0
    };
    Ok(RegisterPacket {
        operation,
        regfile: fields[0],
        address: fields[1],
        start_bit,
        end_bit,
        value,
    })
}

fn parse_number(input: &str) -> CliResult<u32> {
    let input = input.trim();
    let parsed = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|_| CliError::usage(format!("invalid number: {input}")))
}
