//! Ordered byte transports beneath the devlink protocol engine.
//!
//! Provides a unified [`LinkStream`] over the transports a link can run on:
//! - Unix domain sockets (a device process on the same host)
//! - An emulated in-process duplex pipe (tests and the emulated device bus)
//!
//! This is the lowest layer of devlink. It also defines how devices are
//! described and discovered ([`DeviceDescriptor`], [`DeviceBackend`]) so the
//! link manager can stay independent of any one bus.

pub mod device;
pub mod emulated;
pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use device::{
    DeviceBackend, DeviceDescriptor, DeviceRequirements, DeviceState, Protocol, StateFilter,
};
pub use emulated::pipe_pair;
pub use error::{Result, TransportError};
pub use traits::LinkStream;

#[cfg(unix)]
pub use uds::{UdsBackend, UnixDomainSocket};
