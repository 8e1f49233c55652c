//! Device descriptors and the backend seam used for discovery, boot and open.

use std::fmt;

use crate::error::Result;
use crate::traits::LinkStream;

/// Physical bus a device is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Matches every protocol in [`DeviceRequirements`].
    Any,
    Usb,
    Pcie,
    /// A device process reached over a local socket.
    Ipc,
    /// In-process emulated device.
    Emulated,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Usb => "usb",
            Protocol::Pcie => "pcie",
            Protocol::Ipc => "ipc",
            Protocol::Emulated => "emulated",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether firmware is running on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Booted,
    Unbooted,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Booted => "booted",
            DeviceState::Unbooted => "unbooted",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State selector for discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    Any,
    Booted,
    Unbooted,
}

impl StateFilter {
    pub fn accepts(self, state: DeviceState) -> bool {
        match self {
            StateFilter::Any => true,
            StateFilter::Booted => state == DeviceState::Booted,
            StateFilter::Unbooted => state == DeviceState::Unbooted,
        }
    }
}

/// A device as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    pub protocol: Protocol,
    pub platform: String,
    pub state: DeviceState,
}

/// What a caller is looking for. Unset fields match anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequirements {
    pub name: Option<String>,
    pub protocol: Protocol,
    pub platform: Option<String>,
}

impl Default for DeviceRequirements {
    fn default() -> Self {
        Self {
            name: None,
            protocol: Protocol::Any,
            platform: None,
        }
    }
}

impl DeviceRequirements {
    /// Require a specific device by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        if let Some(name) = &self.name {
            if name != &device.name {
                return false;
            }
        }
        if self.protocol != Protocol::Any && self.protocol != device.protocol {
            return false;
        }
        if let Some(platform) = &self.platform {
            if platform != &device.platform {
                return false;
            }
        }
        true
    }
}

/// A source of devices: enumerates them, loads firmware and opens a
/// transport to a booted device.
pub trait DeviceBackend: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    fn protocol(&self) -> Protocol;

    /// Enumerate devices currently visible to this backend.
    fn discover(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open an ordered byte transport to a booted device.
    fn open(&self, device: &DeviceDescriptor) -> Result<LinkStream>;

    /// Load a firmware image onto an unbooted device.
    fn boot(&self, device: &DeviceDescriptor, firmware: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, protocol: Protocol, state: DeviceState) -> DeviceDescriptor {
        DeviceDescriptor {
            name: name.to_string(),
            protocol,
            platform: "emu".to_string(),
            state,
        }
    }

    #[test]
    fn default_requirements_match_everything() {
        let reqs = DeviceRequirements::default();
        assert!(reqs.matches(&descriptor("a", Protocol::Usb, DeviceState::Booted)));
        assert!(reqs.matches(&descriptor("b", Protocol::Emulated, DeviceState::Unbooted)));
    }

    #[test]
    fn requirements_filter_on_every_set_field() {
        let dev = descriptor("emu-0", Protocol::Emulated, DeviceState::Booted);
        assert!(DeviceRequirements::named("emu-0").matches(&dev));
        assert!(!DeviceRequirements::named("emu-1").matches(&dev));
        assert!(!DeviceRequirements::default()
            .with_protocol(Protocol::Pcie)
            .matches(&dev));
        assert!(DeviceRequirements::default()
            .with_platform("emu")
            .matches(&dev));
        assert!(!DeviceRequirements::default()
            .with_platform("x86")
            .matches(&dev));
    }

    #[test]
    fn state_filter() {
        assert!(StateFilter::Any.accepts(DeviceState::Unbooted));
        assert!(StateFilter::Booted.accepts(DeviceState::Booted));
        assert!(!StateFilter::Booted.accepts(DeviceState::Unbooted));
        assert!(StateFilter::Unbooted.accepts(DeviceState::Unbooted));
    }
}
