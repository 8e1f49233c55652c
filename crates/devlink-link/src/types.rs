//! Identifiers and small value types shared across the link layer.

use std::fmt;

use bytes::Bytes;

/// Handle of a link owned by a [`LinkManager`](crate::LinkManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u32);

/// Stream identifier, unique within a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

/// Packet identifier, strictly increasing per stream starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(pub u32);

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_inner!(LinkId, StreamId, PacketId);

/// Which end of a link this side is. The host allocates stream ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Host,
    Device,
}

impl LinkRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkRole::Host => "host",
            LinkRole::Device => "device",
        }
    }

    /// Packet length this side frames its own sends with.
    pub fn send_target(self) -> PacketLengthTarget {
        match self {
            LinkRole::Host => PacketLengthTarget::Host,
            LinkRole::Device => PacketLengthTarget::Device,
        }
    }
}

/// Selects the host-to-device or device-to-host packet length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLengthTarget {
    Host,
    Device,
}

/// Selects which fill level [`Link::fill_level`](crate::Link::fill_level) reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillSide {
    /// Inbound bytes not yet released by the local consumer.
    Local,
    /// Bytes this side wrote that the peer has not released yet. Advisory.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    Connecting,
    Connected,
    Resetting,
    Closed,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkState::Uninitialized => "uninitialized",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Resetting => "resetting",
            LinkState::Closed => "closed",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closing,
    Closed,
}

/// A packet received on a stream.
///
/// Cloning shares the payload; it is never copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_id: StreamId,
    pub id: PacketId,
    pub data: Bytes,
}

impl Packet {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Result of [`LinkManager::initialize`](crate::LinkManager::initialize).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Initialized,
    AlreadyInitialized,
}
