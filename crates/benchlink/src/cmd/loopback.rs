use std::sync::Arc;
use std::time::Duration;

use benchlink_codec::{AsciiCodec, BinaryCodec, Codec, ScpiCodec};
use benchlink_session::{PacketStore, Session, SessionBuilder, SessionStats, TracingLogger};
use benchlink_storage::ChannelStorage;
use benchlink_transport::{LoopbackConfig, LoopbackTransport, Transport};
use tracing::{debug, Level};

use crate::cmd::{CodecKind, LoopbackArgs};
use crate::exit::{
    io_error, session_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT,
    USAGE,
};
use crate::output::{print_loopback_report, OutputFormat};

struct Report {
    codec: &'static str,
    commands: Vec<String>,
    stats: SessionStats,
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    let interval = parse_duration(&args.interval)?;
    let timeout = parse_duration(&args.timeout)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start runtime", err))?;

    let report = match args.codec {
        CodecKind::Binary => {
            runtime.block_on(exercise(BinaryCodec::default(), &args, interval, timeout))
        }
        CodecKind::Ascii => {
            runtime.block_on(exercise(AsciiCodec::default(), &args, interval, timeout))
        }
        CodecKind::Scpi => runtime.block_on(exercise(ScpiCodec, &args, interval, timeout)),
    }?;

    print_loopback_report(report.codec, &report.commands, report.stats, format);
    Ok(SUCCESS)
}

/// Send `count` commands through a polling session and collect what the
/// loop hands back.
async fn exercise<C: Codec>(
    codec: C,
    args: &LoopbackArgs,
    interval: Duration,
    timeout: Duration,
) -> CliResult<Report> {
    let name = codec.name();
    let transport = Arc::new(LoopbackTransport::new(LoopbackConfig::with_capacity(
        args.capacity,
    )));
    transport
        .connect()
        .await
        .map_err(|err| transport_error("connect failed", err))?;

    let storage = ChannelStorage::unbounded();
    let session = SessionBuilder::new(Arc::clone(&transport), codec)
        .consumer(TracingLogger::new("echo", Level::DEBUG))
        .consumer(PacketStore::commands(storage.clone()))
        .polling(interval)
        .build()
        .map_err(|err| session_error("session setup failed", err))?;

    let outcome = send_and_collect(&session, &storage, args.count, timeout).await;
    session.dispose().await;
    outcome?;

    Ok(Report {
        codec: name,
        commands: storage.snapshot(),
        stats: session.stats(),
    })
}

async fn send_and_collect<C: Codec>(
    session: &Session<Arc<LoopbackTransport>, C>,
    storage: &ChannelStorage<String>,
    count: usize,
    timeout: Duration,
) -> CliResult<()> {
    for i in 0..count {
        session
            .send_command(format!("PING {i}"))
            .await
            .map_err(|err| session_error("send failed", err))?;
    }
    debug!(count, "commands sent, waiting for echoes");

    let stored = match tokio::time::timeout(timeout, storage.wait_for_count(count)).await {
        Ok(stored) => stored,
        Err(_) => {
            session
                .stop_polling()
                .await
                .map_err(|err| session_error("polling failed", err))?;
            return Err(CliError::new(
                TIMEOUT,
                format!(
                    "timed out after {timeout:?} with {} of {count} echoes",
                    storage.count()
                ),
            ));
        }
    };
    if stored < count {
        return Err(CliError::new(
            FAILURE,
            format!("only {stored} of {count} commands came back"),
        ));
    }
    Ok(())
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(codec: CodecKind, count: usize) -> LoopbackArgs {
        LoopbackArgs {
            codec,
            count,
            interval: "5ms".to_string(),
            capacity: 65536,
            timeout: "5s".to_string(),
        }
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("15ms").unwrap(), Duration::from_millis(15));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0ms").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[tokio::test]
    async fn ascii_loop_returns_every_command() {
        let report = exercise(
            AsciiCodec::default(),
            &args(CodecKind::Ascii, 3),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(report.commands, vec!["PING 0\n", "PING 1\n", "PING 2\n"]);
        assert_eq!(report.stats.bytes_written, 21);
        assert_eq!(report.stats.bytes_read, 21);
    }

    #[tokio::test]
    async fn binary_loop_returns_every_command() {
        let report = exercise(
            BinaryCodec::default(),
            &args(CodecKind::Binary, 2),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(report.commands, vec!["PING 0", "PING 1"]);
        assert_eq!(report.stats.bytes_written, 512);
    }
}
