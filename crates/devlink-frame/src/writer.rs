use std::io::{ErrorKind, Write};
use std::slice;

use bytes::BytesMut;
use devlink_transport::LinkStream;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Pushes link events onto a byte stream.
///
/// A batch (the chunks of one packet, or a reply) is encoded into one buffer
/// and handed to the transport with a single flush, so events of concurrent
/// senders never interleave inside a batch.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
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

    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.write_batch(slice::from_ref(frame))
    }

    /// Encode and send `frames` in order. Nothing is written when any of
    /// them carries a payload over the configured limit.
    pub fn write_batch(&mut self, frames: &[Frame]) -> Result<()> {
        self.buf.clear();
        for frame in frames {
            if frame.payload.len() > self.config.max_payload_size {
                return Err(FrameError::PayloadTooLarge {
                    size: frame.payload.len(),
                    max: self.config.max_payload_size,
                });
            }
            encode_frame(frame, &mut self.buf)?;
        }
        self.send_buffered()?;
        self.flush()
    }

    fn send_buffered(&mut self) -> Result<()> {
        let mut sent = 0;
        while sent < self.buf.len() {
            match self.inner.write(&self.buf[sent..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => sent += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl FrameWriter<LinkStream> {
    /// Wrap a link transport, applying the configured write timeout to it.
    pub fn with_config_link(inner: LinkStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}
