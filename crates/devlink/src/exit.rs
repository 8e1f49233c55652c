use std::fmt;
use std::io;

use devlink_link::{ErrorKind, LinkError};
use devlink_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
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
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::PathTooLong { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn link_error(context: &str, err: LinkError) -> CliError {
    let code = match err.kind() {
        ErrorKind::InvalidArgument | ErrorKind::InvalidConfiguration => USAGE,
        ErrorKind::ResourceExhausted => DATA_INVALID,
        ErrorKind::Timeout => TIMEOUT,
        ErrorKind::LinkDown | ErrorKind::DeviceNotFound | ErrorKind::ConnectFailed => {
            TRANSPORT_ERROR
        }
        ErrorKind::InvalidState | ErrorKind::NotFound | ErrorKind::StreamClosed => FAILURE,
    };
    CliError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn link_errors_map_to_exit_codes() {
        assert_eq!(link_error("x", LinkError::Timeout(Duration::from_secs(1))).code, TIMEOUT);
        assert_eq!(link_error("x", LinkError::LinkDown).code, TRANSPORT_ERROR);
        assert_eq!(
            link_error("x", LinkError::DeviceNotFound("emu".into())).code,
            TRANSPORT_ERROR
        );
        assert_eq!(
            link_error("x", LinkError::InvalidConfiguration("bad".into())).code,
            USAGE
        );
        assert_eq!(
            link_error("x", LinkError::ResourceExhausted("full".into())).code,
            DATA_INVALID
        );
    }

    #[test]
    fn refused_connection_is_transport_error() {
        let err = io_error(
            "connect",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert_eq!(err.code, TRANSPORT_ERROR);
        assert!(err.message.starts_with("connect: "));
    }
}
