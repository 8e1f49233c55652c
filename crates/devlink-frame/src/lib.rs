//! Event framing and packetization for devlink.
//!
//! Every event on a link is framed with a fixed 16-byte header:
//! - A 2-byte magic number ("DL") for stream synchronization
//! - Event kind and flags (1 byte each)
//! - Stream id and event id (4 bytes little-endian each)
//! - A 4-byte little-endian payload length
//!
//! The [`framer`] module cuts outbound packets into transport-sized chunks
//! and stitches inbound chunks back together.

pub mod codec;
pub mod control;
pub mod error;
pub mod event;
pub mod framer;
pub mod reader;
pub mod writer;

pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use event::{EventKind, FLAG_LAST, FLAG_NACK, UNASSIGNED_STREAM};
pub use framer::{
    align_up, split, validate_packet_length, Chunk, Chunks, Reassembler, ALIGNMENT,
    DEFAULT_PACKET_LENGTH, PACKET_LENGTH_UNIT,
};
pub use reader::FrameReader;
pub use writer::FrameWriter;
