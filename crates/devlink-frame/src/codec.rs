use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::event::{EventKind, FLAG_LAST, FLAG_NACK};

/// Frame header: magic (2) + kind (1) + flags (1) + stream (4) + event (4) + length (4).
pub const HEADER_SIZE: usize = 16;

/// Magic bytes: "DL" (0x44 0x4C).
pub const MAGIC: [u8; 2] = [0x44, 0x4C];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// A framed link event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: EventKind,
    pub flags: u8,
    /// Stream the event refers to; ignored by link-level kinds.
    pub stream_id: u32,
    /// Request/response correlation id.
    pub event_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with no flags set.
    pub fn new(kind: EventKind, stream_id: u32, event_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            flags: 0,
            stream_id,
            event_id,
            payload: payload.into(),
        }
    }

    /// A payload-less event.
    pub fn control(kind: EventKind, stream_id: u32, event_id: u32) -> Self {
        Self::new(kind, stream_id, event_id, Bytes::new())
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    pub fn is_nack(&self) -> bool {
        self.flags & FLAG_NACK != 0
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format (all integers little-endian):
/// ```text
/// ┌────────┬──────┬───────┬───────────┬──────────┬──────────┬───────────┐
/// │ Magic  │ Kind │ Flags │ Stream id │ Event id │ Length   │ Payload   │
/// │ "DL"   │ (1B) │ (1B)  │ (4B)      │ (4B)     │ (4B)     │ (Length)  │
/// └────────┴──────┴───────┴───────────┴──────────┴──────────┴───────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let len = frame.payload.len();
    if len > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + len);
    dst.put_slice(&MAGIC);
    dst.put_u8(frame.kind as u8);
    dst.put_u8(frame.flags);
    dst.put_u32_le(frame.stream_id);
    dst.put_u32_le(frame.event_id);
    dst.put_u32_le(len as u32);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. Header errors are
/// reported as soon as the header is complete, without waiting for payload.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let mut header = &src[2..HEADER_SIZE];
    let kind = EventKind::try_from(header.get_u8())?;
    let flags = header.get_u8();
    let stream_id = header.get_u32_le();
    let event_id = header.get_u32_le();
    let payload_len = header.get_u32_le() as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        kind,
        flags,
        stream_id,
        event_id,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
