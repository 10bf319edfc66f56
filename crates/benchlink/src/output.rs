use std::fmt::Write as _;
use std::io::IsTerminal;

use benchlink_codec::Packet;
use benchlink_session::SessionStats;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::exit::{CliError, CliResult};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

#[derive(Serialize)]
struct EncodedOutput<'a> {
    codec: &'a str,
    bytes: usize,
    hex: String,
}

pub fn print_encoded(codec: &str, bytes: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&EncodedOutput {
            codec,
            bytes: bytes.len(),
            hex: to_hex(bytes),
        }),
        OutputFormat::Table | OutputFormat::Pretty => println!("{}", to_hex(bytes)),
    }
}

/// One line per packet for JSON (newline-delimited), one row per packet
/// for tables.
pub fn print_packets(packets: &[Packet], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for packet in packets {
                print_json(packet);
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "KIND", "PACKET"]);
            for (index, packet) in packets.iter().enumerate() {
                table.add_row(vec![
                    index.to_string(),
                    packet.kind().to_string(),
                    packet_summary(packet),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for packet in packets {
                println!("{}: {}", packet.kind(), packet_summary(packet));
            }
        }
    }
}

#[derive(Serialize)]
struct LoopbackOutput<'a> {
    codec: &'a str,
    commands: &'a [String],
    stats: SessionStats,
}

pub fn print_loopback_report(
    codec: &str,
    commands: &[String],
    stats: SessionStats,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&LoopbackOutput {
            codec,
            commands,
            stats,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "COMMAND"]);
            for (index, command) in commands.iter().enumerate() {
                table.add_row(vec![index.to_string(), command.trim_end().to_string()]);
            }
            println!("{table}");
            println!(
                "read={} written={} packets={}",
                stats.bytes_read, stats.bytes_written, stats.packets_dispatched
            );
        }
        OutputFormat::Pretty => {
            for command in commands {
                println!("{}", command.trim_end());
            }
            println!(
                "codec={codec} read={} written={} packets={}",
                stats.bytes_read, stats.bytes_written, stats.packets_dispatched
            );
        }
    }
}

/// Command text has its line ending trimmed; other packets use `Display`.
fn packet_summary(packet: &Packet) -> String {
    match packet {
        Packet::Command(command) => command.text.trim_end().to_string(),
        other => other.to_string(),
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parse hex text. Whitespace, `:` separators and a leading `0x` are
/// ignored.
pub fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: Vec<u8> = trimmed
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::usage("hex input has an odd number of digits"));
    }

    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    CliError::usage(format!(
                        "invalid hex byte: {}",
                        String::from_utf8_lossy(pair)
                    ))
                })
        })
        .collect()
}
