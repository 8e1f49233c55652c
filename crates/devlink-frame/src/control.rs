//! Payload layouts for control events.
//!
//! | kind | payload |
//! |---|---|
//! | `OpenStream` | requested size (u32 LE) followed by the UTF-8 stream name |
//! | `OpenStreamResponse` | granted capacity (u32 LE); `NACK` when refused |
//! | `Release` | released byte count (u32 LE) |
//! | `SetPacketLength` | packet length (u32 LE) |
//!
//! All other kinds carry no control payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Longest stream name accepted on the wire.
pub const MAX_STREAM_NAME_LEN: usize = 64;

/// Encode an `OpenStream` payload.
pub fn encode_open_stream(name: &str, size: u32) -> Result<Bytes> {
    if name.is_empty() || name.len() > MAX_STREAM_NAME_LEN {
        return Err(FrameError::MalformedPayload {
            kind: "OPEN_STREAM",
        });
    }
    let mut buf = BytesMut::with_capacity(4 + name.len());
    buf.put_u32_le(size);
    buf.put_slice(name.as_bytes());
    Ok(buf.freeze())
}

/// Decode an `OpenStream` payload into `(name, size)`.
pub fn decode_open_stream(payload: &Bytes) -> Result<(String, u32)> {
    let malformed = || FrameError::MalformedPayload {
        kind: "OPEN_STREAM",
    };
    if payload.len() < 5 || payload.len() > 4 + MAX_STREAM_NAME_LEN {
        return Err(malformed());
    }
    let mut buf = payload.clone();
    let size = buf.get_u32_le();
    let name = std::str::from_utf8(&buf).map_err(|_| malformed())?;
    Ok((name.to_string(), size))
}

/// Encode a single u32 payload.
pub fn encode_u32(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

/// Decode a single u32 payload for an event of kind `kind`.
pub fn decode_u32(payload: &Bytes, kind: &'static str) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .as_ref()
        .try_into()
        .map_err(|_| FrameError::MalformedPayload { kind })?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_stream_payload() {
        let payload = encode_open_stream("A", 1000).unwrap();
        assert_eq!(payload.len(), 5);
        assert_eq!(decode_open_stream(&payload).unwrap(), ("A".to_string(), 1000));
    }

    #[test]
    fn open_stream_rejects_bad_names() {
        assert!(encode_open_stream("", 64).is_err());
        assert!(encode_open_stream(&"n".repeat(MAX_STREAM_NAME_LEN + 1), 64).is_err());

        let mut raw = BytesMut::new();
        raw.put_u32_le(64);
        raw.put_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            decode_open_stream(&raw.freeze()),
            Err(FrameError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn u32_payload_requires_exact_length() {
        assert_eq!(decode_u32(&encode_u32(640), "RELEASE").unwrap(), 640);
        assert!(decode_u32(&Bytes::from_static(&[1, 2, 3]), "RELEASE").is_err());
        assert!(decode_u32(&Bytes::new(), "SET_PACKET_LENGTH").is_err());
    }
}
