//! Stream multiplexing and link management for devlink.
//!
//! A [`Link`] carries named, flow-controlled streams between a host and a
//! device over one [`LinkStream`](devlink_transport::LinkStream). The
//! [`LinkManager`] finds devices through registered
//! [`DeviceBackend`](devlink_transport::DeviceBackend)s, boots them and
//! hands out connected links.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use devlink_link::{DeviceProgram, EmulatedBus, LinkConfig, LinkManager};
//! use devlink_transport::DeviceRequirements;
//!
//! let bus = Arc::new(EmulatedBus::new());
//! bus.add_booted_device("emu-0", DeviceProgram::Echo);
//!
//! let manager = LinkManager::new(LinkConfig::default());
//! manager.register_backend(bus);
//! manager.initialize()?;
//!
//! let link = manager.link(manager.connect(&DeviceRequirements::default())?)?;
//! let stream = link.open_stream("A", 1000)?;
//! link.write(stream, b"hello")?;
//! let packet = link.read(stream)?;
//! assert_eq!(&packet.data[..], b"hello");
//! link.release(stream)?;
//! # Ok::<(), devlink_link::LinkError>(())
//! ```

pub mod config;
mod dispatcher;
pub mod emulator;
pub mod error;
pub mod firmware;
mod link;
pub mod manager;
pub mod profile;
mod registry;
pub mod types;

pub use config::{parse_packet_length, LinkConfig};
pub use emulator::EmulatedBus;
pub use error::{ErrorKind, LinkError, Result};
pub use firmware::{DeviceProgram, FirmwareImage};
pub use link::Link;
pub use manager::LinkManager;
pub use profile::ProfileSnapshot;
pub use types::{
    FillSide, InitStatus, LinkId, LinkRole, LinkState, Packet, PacketId, PacketLengthTarget,
    StreamId, StreamState,
};
