use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use devlink_transport::LinkStream;

use crate::codec::{decode_frame, Frame, FrameConfig, HEADER_SIZE};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const MIN_READ: usize = 4 * 1024;

/// Pulls link events off a byte stream.
///
/// Bytes are buffered until a whole event (16-byte header plus payload) is
/// present. Once the header is in, the next read is sized to the rest of the
/// event so large write chunks arrive in few system calls.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Block until the next event is complete.
    ///
    /// End of stream is `ConnectionClosed`, whether or not it cuts an event
    /// in half. Header errors surface before the payload is read.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(frame);
            }
            if self.fill()? == 0 {
                return Err(FrameError::ConnectionClosed);
            }
        }
    }

    /// Bytes still missing from the event at the front of the buffer.
    fn missing(&self) -> usize {
        if self.buf.len() < HEADER_SIZE {
            return HEADER_SIZE - self.buf.len();
        }
        let len = u32::from_le_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]]);
        (HEADER_SIZE + len as usize).saturating_sub(self.buf.len())
    }

    fn fill(&mut self) -> Result<usize> {
        let start = self.buf.len();
        self.buf.resize(start + self.missing().max(MIN_READ), 0);
        loop {
            match self.inner.read(&mut self.buf[start..]) {
                Ok(n) => {
                    self.buf.truncate(start + n);
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buf.truncate(start);
                    return Err(FrameError::Io(err));
                }
            }
        }
    }
}

impl FrameReader<LinkStream> {
    /// Wrap a link transport, applying the configured read timeout to it.
    pub fn with_config_link(inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner.set_read_timeout(config.read_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, MAGIC};
    use crate::event::{EventKind, FLAG_LAST};
    use crate::writer::FrameWriter;

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            encode_frame(frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn read_multiple_frames() {
        let bytes = wire(&[
            Frame::control(EventKind::Ping, 0, 1),
            Frame::new(EventKind::Write, 3, 2, "two").with_flags(FLAG_LAST),
            Frame::control(EventKind::CloseStream, 3, 3),
        ]);

        let mut reader = FrameReader::new(Cursor::new(bytes));

        assert_eq!(reader.read_frame().unwrap().kind, EventKind::Ping);
        let f2 = reader.read_frame().unwrap();
        assert_eq!((f2.stream_id, f2.payload.as_ref()), (3, b"two".as_ref()));
        assert!(f2.is_last());
        assert_eq!(reader.read_frame().unwrap().kind, EventKind::CloseStream);
    }

    #[test]
    fn partial_read_handling() {
        let bytes = wire(&[Frame::new(EventKind::Write, 4, 0, "slow")]);
        let mut reader = FrameReader::new(ByteByByteReader { bytes, pos: 0 });

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.stream_id, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn large_payload_read_past_minimum_chunk() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let bytes = wire(&[
            Frame::new(EventKind::Write, 9, 1, payload.clone()).with_flags(FLAG_LAST),
            Frame::control(EventKind::Ping, 0, 2),
        ]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        assert_eq!(reader.read_frame().unwrap().payload.as_ref(), &payload[..]);
        assert_eq!(reader.read_frame().unwrap().kind, EventKind::Ping);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u8(EventKind::Write as u8);
        partial.put_u8(0);
        partial.put_u32_le(2);
        partial.put_u32_le(0);
        partial.put_u32_le(16);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let bytes = wire(&[Frame::new(EventKind::Write, 1, 0, vec![0u8; 1024])]);
        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[test]
    fn interrupted_read_retries() {
        let bytes = wire(&[Frame::control(EventKind::Reset, 0, 8)]);
        let mut framed = FrameReader::new(InterruptedThenData {
            interrupted: false,
            inner: Cursor::new(bytes),
        });
        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.kind, EventKind::Reset);
        assert_eq!(frame.event_id, 8);
    }

    #[test]
    fn roundtrip_over_emulated_pipe() {
        let (left, right) = devlink_transport::pipe_pair();
        let mut writer = FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer
            .write_frame(&Frame::control(EventKind::Ping, 0, 77))
            .unwrap();
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.kind, EventKind::Ping);
        assert_eq!(frame.event_id, 77);
    }

    #[test]
    fn link_stream_read_timeout_applies() {
        let (left, _right) = devlink_transport::pipe_pair();
        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config_link(left, cfg).unwrap();
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }
}
