//! Packet framing: outbound splitting, size alignment and inbound reassembly.
//!
//! A packet written on a stream leaves this side as one or more `Write`
//! chunks no longer than the negotiated packet length. The final chunk
//! carries [`FLAG_LAST`](crate::FLAG_LAST). The receiver concatenates chunks
//! per stream in transport order, so packet boundaries survive the trip.

use std::collections::{HashMap, HashSet};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::error::{FrameError, Result};

/// Granularity of stream capacity and fill accounting.
pub const ALIGNMENT: usize = 64;

/// Packet lengths must be a multiple of this.
pub const PACKET_LENGTH_UNIT: u32 = 1024;

/// Packet length used when none is configured: 64 KiB.
pub const DEFAULT_PACKET_LENGTH: u32 = 64 * 1024;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
pub fn align_up(size: usize) -> usize {
    size.checked_next_multiple_of(ALIGNMENT)
        .unwrap_or(usize::MAX - (usize::MAX % ALIGNMENT))
}

/// Check that `len` is usable as a packet length.
pub fn validate_packet_length(len: u32) -> Result<u32> {
    if len == 0 || len % PACKET_LENGTH_UNIT != 0 {
        return Err(FrameError::InvalidConfiguration(format!(
            "packet length {len} must be a positive multiple of {PACKET_LENGTH_UNIT}"
        )));
    }
    Ok(len)
}

/// One piece of a split packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// Set on the final chunk of the packet.
    pub last: bool,
}

/// Split `buffer` into chunks of at most `max_chunk_len` bytes.
///
/// The packet length is validated before anything is produced. An empty
/// buffer yields exactly one empty chunk.
pub fn split(buffer: Bytes, max_chunk_len: u32) -> Result<Chunks> {
    let chunk_len = validate_packet_length(max_chunk_len)? as usize;
    Ok(Chunks {
        data: buffer,
        chunk_len,
        offset: 0,
        done: false,
    })
}

/// Iterator returned by [`split`]. Cloning restarts from the clone point.
#[derive(Debug, Clone)]
pub struct Chunks {
    data: Bytes,
    chunk_len: usize,
    offset: usize,
    done: bool,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }
        let end = (self.offset + self.chunk_len).min(self.data.len());
        let data = self.data.slice(self.offset..end);
        self.offset = end;
        let last = end == self.data.len();
        self.done = last;
        Some(Chunk { data, last })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len();
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks {
    fn len(&self) -> usize {
        if self.done {
            0
        } else {
            (self.data.len() - self.offset).div_ceil(self.chunk_len).max(1)
        }
    }
}

/// Per-stream reassembly of inbound chunks.
#[derive(Debug)]
pub struct Reassembler {
    partial: HashMap<u32, BytesMut>,
    /// Streams whose current packet overflowed; chunks are dropped until LAST.
    discarding: HashSet<u32>,
    max_packet_size: usize,
}

impl Reassembler {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            partial: HashMap::new(),
            discarding: HashSet::new(),
            max_packet_size,
        }
    }

    /// Append a chunk for `stream_id`.
    ///
    /// Returns the complete packet when `last` is set. A packet that grows
    /// past the configured maximum is reported once; its remaining chunks
    /// are swallowed up to and including the LAST one.
    pub fn push(&mut self, stream_id: u32, chunk: Bytes, last: bool) -> Result<Option<Bytes>> {
        if self.discarding.contains(&stream_id) {
            if last {
                self.discarding.remove(&stream_id);
            }
            return Ok(None);
        }

        let pending = self.partial.get(&stream_id).map_or(0, BytesMut::len);
        if pending + chunk.len() > self.max_packet_size {
            self.partial.remove(&stream_id);
            if !last {
                self.discarding.insert(stream_id);
            }
            warn!(
                stream_id,
                max = self.max_packet_size,
                "dropping oversized packet during reassembly"
            );
            return Err(FrameError::ReassemblyOverflow {
                stream_id,
                max: self.max_packet_size,
            });
        }

        if last {
            let packet = match self.partial.remove(&stream_id) {
                Some(mut buf) => {
                    buf.extend_from_slice(&chunk);
                    buf.freeze()
                }
                // Single-chunk packets keep the frame's buffer.
                None => chunk,
            };
            return Ok(Some(packet));
        }

        self.partial
            .entry(stream_id)
            .or_default()
            .extend_from_slice(&chunk);
        Ok(None)
    }

    /// Forget any partial packet for `stream_id`.
    pub fn discard(&mut self, stream_id: u32) {
        self.partial.remove(&stream_id);
        self.discarding.remove(&stream_id);
    }

    /// Number of streams with a packet in flight.
    pub fn pending_streams(&self) -> usize {
        self.partial.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_64() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 64);
        assert_eq!(align_up(64), 64);
        assert_eq!(align_up(100), 128);
        assert_eq!(align_up(600), 640);
        assert_eq!(align_up(1000), 1024);
    }

    #[test]
    fn packet_length_validation() {
        assert_eq!(validate_packet_length(1024).unwrap(), 1024);
        assert_eq!(validate_packet_length(DEFAULT_PACKET_LENGTH).unwrap(), 65536);
        assert!(matches!(
            validate_packet_length(1500),
            Err(FrameError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            validate_packet_length(0),
            Err(FrameError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn split_rejects_bad_length_before_yielding() {
        assert!(split(Bytes::from_static(b"abc"), 1000).is_err());
    }

    #[test]
    fn split_covers_buffer_without_gaps() {
        let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let chunks: Vec<Chunk> = split(Bytes::from(data.clone()), 1024).unwrap().collect();

        assert_eq!(
            chunks.iter().map(|c| c.data.len()).collect::<Vec<_>>(),
            vec![1024, 1024, 452]
        );
        assert_eq!(
            chunks.iter().map(|c| c.last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn split_exact_multiple_has_no_trailing_empty_chunk() {
        let chunks = split(Bytes::from(vec![1u8; 2048]), 1024).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.filter(|c| c.data.is_empty()).count(), 0);
    }

    #[test]
    fn split_empty_buffer_yields_one_empty_chunk() {
        let chunks: Vec<Chunk> = split(Bytes::new(), 1024).unwrap().collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].data.is_empty());
        assert!(chunks[0].last);
    }

    #[test]
    fn split_is_restartable() {
        let mut chunks = split(Bytes::from(vec![7u8; 3000]), 1024).unwrap();
        chunks.next();
        let rest = chunks.clone();
        assert_eq!(chunks.count(), 2);
        assert_eq!(rest.count(), 2);
    }

    #[test]
    fn reassembly_restores_packet_boundaries() {
        let mut r = Reassembler::new(1 << 20);
        assert_eq!(r.push(1, Bytes::from_static(b"hel"), false).unwrap(), None);
        let other = r.push(2, Bytes::from_static(b"other"), true).unwrap();
        assert_eq!(other.unwrap().as_ref(), b"other");
        assert_eq!(r.pending_streams(), 1);
        let hello = r.push(1, Bytes::from_static(b"lo"), true).unwrap();
        assert_eq!(hello.unwrap().as_ref(), b"hello");
        assert_eq!(r.pending_streams(), 0);
    }

    #[test]
    fn reassembly_overflow_drops_partial() {
        let mut r = Reassembler::new(8);
        r.push(3, Bytes::from_static(b"12345"), false).unwrap();
        let err = r.push(3, Bytes::from_static(b"6789"), true).unwrap_err();
        assert!(matches!(
            err,
            FrameError::ReassemblyOverflow { stream_id: 3, max: 8 }
        ));
        assert_eq!(r.pending_streams(), 0);
    }

    #[test]
    fn discard_forgets_partial_packet() {
        let mut r = Reassembler::new(64);
        r.push(4, Bytes::from_static(b"part"), false).unwrap();
        r.discard(4);
        let fresh = r.push(4, Bytes::from_static(b"new"), true).unwrap();
        assert_eq!(fresh.unwrap().as_ref(), b"new");
    }

    #[test]
    fn overflowing_packet_tail_is_not_delivered() {
        let mut r = Reassembler::new(8);
        r.push(5, Bytes::from_static(b"12345"), false).unwrap();
        assert!(r.push(5, Bytes::from_static(b"6789"), false).is_err());

        // The rest of the oversized packet is swallowed without another error.
        assert_eq!(r.push(5, Bytes::from_static(b"more"), false).unwrap(), None);
        assert_eq!(r.push(5, Bytes::from_static(b"ab"), true).unwrap(), None);
        assert_eq!(r.pending_streams(), 0);

        let next = r.push(5, Bytes::from_static(b"next"), true).unwrap();
        assert_eq!(next.unwrap().as_ref(), b"next");
    }
}
