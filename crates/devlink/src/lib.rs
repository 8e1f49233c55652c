//! Host-to-device link protocol.
//!
//! devlink multiplexes named, flow-controlled streams over a single ordered
//! transport between a host process and a compute device, with safe
//! teardown of every blocked caller when a link goes away.
//!
//! # Crate Structure
//!
//! - [`sync`]: the reference-counted semaphore links are built on
//! - [`transport`]: byte transports (Unix sockets, emulated pipes) and device backends
//! - [`frame`]: event wire format and packet chunking
//! - [`link`]: streams, links, the link manager and the emulated device bus

/// Re-export synchronization types.
pub mod sync {
    pub use devlink_sync::*;
}

/// Re-export transport types.
pub mod transport {
    pub use devlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use devlink_frame::*;
}

/// Re-export link types.
pub mod link {
    pub use devlink_link::*;
}

pub use devlink_link::{
    DeviceProgram, EmulatedBus, FillSide, Link, LinkConfig, LinkError, LinkId, LinkManager,
    LinkRole, Packet, PacketLengthTarget, StreamId,
};
pub use devlink_transport::{DeviceRequirements, StateFilter};
