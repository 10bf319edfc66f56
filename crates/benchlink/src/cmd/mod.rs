use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod decode;
pub mod encode;
pub mod loopback;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Encode one packet and print the wire bytes as hex.
    Encode(EncodeArgs),
    /// Decode a captured byte stream and print the packets.
    Decode(DecodeArgs),
    /// Run a polling session against the in-memory loopback transport.
    Loopback(LoopbackArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Encode(args) => encode::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Loopback(args) => loopback::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum CodecKind {
    Binary,
    Ascii,
    Scpi,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum FrameArg {
    Small,
    Medium,
    Large,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Protocol codec.
    #[arg(long, value_enum, default_value = "binary")]
    pub codec: CodecKind,
    /// Command text to encode.
    #[arg(long, conflicts_with = "register", required_unless_present = "register")]
    pub command: Option<String>,
    /// Register access: OP:REGFILE:ADDRESS[:START:END][:VALUE], OP one of
    /// w, r, bw, br, wr (read result), bwr (bits read result). Numbers
    /// accept a 0x prefix.
    #[arg(long, conflicts_with = "command")]
    pub register: Option<String>,
    /// Smallest binary command frame.
    #[arg(long, value_enum, default_value = "medium")]
    pub frame: FrameArg,
    /// Write the 0xCCCC filler instead of a computed CRC.
    #[arg(long)]
    pub placeholder_crc: bool,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Protocol codec.
    #[arg(long, value_enum, default_value = "binary")]
    pub codec: CodecKind,
    /// Hex-encoded input bytes.
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    pub hex: Option<String>,
    /// Read raw input bytes from a file.
    #[arg(long, conflicts_with = "hex")]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Protocol codec used on both ends of the loop.
    #[arg(long, value_enum, default_value = "ascii")]
    pub codec: CodecKind,
    /// Number of commands to send.
    #[arg(long, default_value = "10")]
    pub count: usize,
    /// Poll interval (e.g. 15ms, 1s).
    #[arg(long, default_value = "15ms")]
    pub interval: String,
    /// Loopback ring capacity in bytes.
    #[arg(long, default_value = "65536")]
    pub capacity: usize,
    /// Give up waiting for the echoes after this long.
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
