use std::path::PathBuf;

/// Errors that can occur in transport and device operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// No device matched the request.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device exists but is not in a state that allows the operation.
    #[error("device {device} is {state}")]
    DeviceState { device: String, state: &'static str },

    /// Loading firmware onto a device failed.
    #[error("boot of {device} failed: {reason}")]
    Boot { device: String, reason: String },

    /// The backend does not implement the operation.
    #[error("operation not supported by {backend} backend: {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
