use devlink_transport::TransportError;

/// Errors that can occur during frame encoding, decoding and packetization.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x444C \"DL\")")]
    InvalidMagic,

    /// The frame header names an event kind this side does not know.
    #[error("unknown event kind 0x{0:02x}")]
    UnknownKind(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A control payload does not have the layout its kind requires.
    #[error("malformed {kind} payload")]
    MalformedPayload { kind: &'static str },

    /// A packet length or framing parameter is not acceptable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A reassembled packet grew beyond the configured maximum.
    #[error("packet on stream {stream_id} exceeds {max} bytes during reassembly")]
    ReassemblyOverflow { stream_id: u32, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl From<TransportError> for FrameError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(io) | TransportError::Accept(io) => FrameError::Io(io),
            TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => {
                FrameError::Io(source)
            }
            other => FrameError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
