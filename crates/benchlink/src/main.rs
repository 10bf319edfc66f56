mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "benchlink", version, about = "Instrument link toolkit")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "warn",
        env = "BENCHLINK_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encode_subcommand() {
        let cli = Cli::try_parse_from([
            "benchlink",
            "encode",
            "--codec",
            "binary",
            "--command",
            "*IDN?",
        ])
        .expect("encode args should parse");

        assert!(matches!(cli.command, Command::Encode(_)));
    }

    #[test]
    fn rejects_command_with_register() {
        let err = Cli::try_parse_from([
            "benchlink",
            "encode",
            "--command",
            "*IDN?",
            "--register",
            "r:0:10",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_loopback_with_global_format() {
        let cli = Cli::try_parse_from([
            "benchlink",
            "loopback",
            "--count",
            "3",
            "--format",
            "json",
        ])
        .expect("loopback args should parse");
        assert!(matches!(cli.command, Command::Loopback(_)));
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
    }
}
