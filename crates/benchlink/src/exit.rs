use std::fmt;
use std::io;

use benchlink_codec::CodecError;
use benchlink_session::SessionError;
use benchlink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::InvalidInput => USAGE,
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => DATA_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        TransportError::AlreadySubscribed => CliError::new(INTERNAL, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn codec_error(context: &str, err: CodecError) -> CliError {
    match err {
        CodecError::Io(source) => io_error(context, source),
        CodecError::UnsupportedPacketKind { .. } => CliError::usage(format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn session_error(context: &str, err: SessionError) -> CliError {
    match err {
        SessionError::Codec(err) => codec_error(context, err),
        SessionError::Transport(err) => transport_error(context, err),
        SessionError::NotConnected => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        SessionError::BufferOverflow { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        SessionError::Closed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
