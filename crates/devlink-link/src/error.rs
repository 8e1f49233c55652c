use std::time::Duration;

use devlink_frame::FrameError;
use devlink_sync::SyncError;
use devlink_transport::TransportError;

use crate::types::StreamId;

/// Errors that can occur in link, stream and device operations.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Synchronization primitive error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No slot, buffer space or peer allocation is available.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The link is not connected (never was, was reset, or the transport failed).
    #[error("link is down")]
    LinkDown,

    /// The stream was closed locally or by the peer.
    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    #[error("no device matches: {0}")]
    DeviceNotFound(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),
}

/// Language-neutral classification of a [`LinkError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidConfiguration,
    InvalidState,
    ResourceExhausted,
    NotFound,
    Timeout,
    LinkDown,
    StreamClosed,
    DeviceNotFound,
    ConnectFailed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::InvalidConfiguration => "invalid_configuration",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::LinkDown => "link_down",
            ErrorKind::StreamClosed => "stream_closed",
            ErrorKind::DeviceNotFound => "device_not_found",
            ErrorKind::ConnectFailed => "connect_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LinkError {
    /// Collapse this error into the taxonomy shared by every layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Transport(err) => match err {
                TransportError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
                TransportError::Connect { .. } => ErrorKind::ConnectFailed,
                TransportError::PathTooLong { .. } | TransportError::Boot { .. } => {
                    ErrorKind::InvalidArgument
                }
                TransportError::DeviceState { .. } | TransportError::Unsupported { .. } => {
                    ErrorKind::InvalidState
                }
                TransportError::Bind { .. }
                | TransportError::Accept(_)
                | TransportError::Io(_)
                | TransportError::Shutdown => ErrorKind::LinkDown,
            },
            LinkError::Frame(err) => match err {
                FrameError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
                FrameError::PayloadTooLarge { .. } | FrameError::ReassemblyOverflow { .. } => {
                    ErrorKind::ResourceExhausted
                }
                FrameError::InvalidMagic
                | FrameError::UnknownKind(_)
                | FrameError::MalformedPayload { .. } => ErrorKind::InvalidState,
                FrameError::Io(_) | FrameError::ConnectionClosed => ErrorKind::LinkDown,
            },
            LinkError::Sync(err) => match err {
                SyncError::InvalidArgument(_) => ErrorKind::InvalidArgument,
                SyncError::InvalidState(_) => ErrorKind::InvalidState,
                SyncError::Timeout(_) => ErrorKind::Timeout,
                SyncError::Cancelled => ErrorKind::LinkDown,
            },
            LinkError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            LinkError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
            LinkError::InvalidState(_) => ErrorKind::InvalidState,
            LinkError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            LinkError::NotFound(_) => ErrorKind::NotFound,
            LinkError::Timeout(_) => ErrorKind::Timeout,
            LinkError::LinkDown => ErrorKind::LinkDown,
            LinkError::StreamClosed(_) => ErrorKind::StreamClosed,
            LinkError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            LinkError::ConnectFailed(_) => ErrorKind::ConnectFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_layer_errors_classify() {
        let err: LinkError = FrameError::InvalidConfiguration("1500".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);

        let err: LinkError = SyncError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err: LinkError = TransportError::DeviceNotFound("emu-9".into()).into();
        assert_eq!(err.kind(), ErrorKind::DeviceNotFound);

        let err: LinkError = FrameError::ConnectionClosed.into();
        assert_eq!(err.kind(), ErrorKind::LinkDown);
    }

    #[test]
    fn stream_closed_names_the_stream() {
        let err = LinkError::StreamClosed(StreamId(3));
        assert_eq!(err.kind(), ErrorKind::StreamClosed);
        assert_eq!(err.to_string(), "stream 3 is closed");
    }
}
