use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Prefix shared by every workspace crate's tracing target.
const CRATE_TARGET: &str = "benchlink";

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// benchlink crates log at `level`; dependencies never below `warn`.
fn targets(level: LogLevel) -> Targets {
    let level = LevelFilter::from(level);
    Targets::new()
        .with_default(level.min(LevelFilter::WARN))
        .with_target(CRATE_TARGET, level)
}

/// Install the stderr subscriber. Stdout stays reserved for command output.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);
    let registry = tracing_subscriber::registry();

    // A subscriber installed earlier (tests) wins.
    let _ = match format {
        LogFormat::Text => registry.with(layer.with_filter(targets(level))).try_init(),
        LogFormat::Json => registry
            .with(layer.json().with_filter(targets(level)))
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[test]
    fn test_workspace_crates_follow_requested_level() {
        let filter = targets(LogLevel::Trace);
        assert!(filter.would_enable("benchlink_session::session", &Level::TRACE));
        assert!(filter.would_enable("benchlink", &Level::DEBUG));
        assert!(!filter.would_enable("tokio::runtime", &Level::INFO));
        assert!(filter.would_enable("tokio::runtime", &Level::WARN));
    }

    #[test]
    fn test_quiet_level_applies_everywhere() {
        let filter = targets(LogLevel::Error);
        assert!(!filter.would_enable("benchlink_codec::binary", &Level::WARN));
        assert!(!filter.would_enable("hyper", &Level::WARN));
        assert!(filter.would_enable("hyper", &Level::ERROR));
    }
}
