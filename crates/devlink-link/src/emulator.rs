//! In-process emulated devices.
//!
//! Each device runs the link protocol in the device role over an emulated
//! pipe. Booting loads a [`FirmwareImage`] that selects the program the
//! device runs on every link opened to it.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use devlink_transport::{
    pipe_pair, DeviceBackend, DeviceDescriptor, DeviceState, LinkStream, Protocol,
    TransportError,
};
use tracing::{debug, info};

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::firmware::{DeviceProgram, FirmwareImage};
use crate::link::Link;
use crate::types::{LinkId, LinkState};

struct EmulatedDevice {
    state: DeviceState,
    program: DeviceProgram,
    sessions: Vec<Arc<Link>>,
}

/// A bus of emulated devices, usable as a [`DeviceBackend`].
pub struct EmulatedBus {
    config: LinkConfig,
    devices: Mutex<BTreeMap<String, EmulatedDevice>>,
    next_link: AtomicU32,
}

impl EmulatedBus {
    pub const PLATFORM: &'static str = "emu";

    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    /// Device-side links use `config` for their limits and timeouts.
    pub fn with_config(config: LinkConfig) -> Self {
        Self {
            config,
            devices: Mutex::new(BTreeMap::new()),
            next_link: AtomicU32::new(0),
        }
    }

    /// Attach an unbooted device.
    pub fn add_device(&self, name: impl Into<String>) -> DeviceDescriptor {
        self.attach(name.into(), DeviceState::Unbooted, DeviceProgram::Idle)
    }

    /// Attach a device that is already running `program`.
    pub fn add_booted_device(
        &self,
        name: impl Into<String>,
        program: DeviceProgram,
    ) -> DeviceDescriptor {
        self.attach(name.into(), DeviceState::Booted, program)
    }

    /// Links currently open to `name`.
    pub fn session_count(&self, name: &str) -> usize {
        self.lock()
            .get(name)
            .map(|device| {
                device
                    .sessions
                    .iter()
                    .filter(|link| link.state() != LinkState::Closed)
                    .count()
            })
            .unwrap_or(0)
    }

    fn attach(&self, name: String, state: DeviceState, program: DeviceProgram) -> DeviceDescriptor {
        let descriptor = describe(&name, state);
        self.lock().insert(
            name,
            EmulatedDevice {
                state,
                program,
                sessions: Vec::new(),
            },
        );
        debug!(device = %descriptor.name, %state, "emulated device attached");
        descriptor
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, EmulatedDevice>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EmulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for EmulatedBus {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn protocol(&self) -> Protocol {
        Protocol::Emulated
    }

    fn discover(&self) -> devlink_transport::Result<Vec<DeviceDescriptor>> {
        Ok(self
            .lock()
            .iter()
            .map(|(name, device)| describe(name, device.state))
            .collect())
    }

    fn open(&self, device: &DeviceDescriptor) -> devlink_transport::Result<LinkStream> {
        let mut devices = self.lock();
        let entry = devices
            .get_mut(&device.name)
            .ok_or_else(|| TransportError::DeviceNotFound(device.name.clone()))?;
        if entry.state != DeviceState::Booted {
            return Err(TransportError::DeviceState {
                device: device.name.clone(),
                state: entry.state.as_str(),
            });
        }
        entry.sessions.retain(|link| link.state() != LinkState::Closed);

        let (host_end, device_end) = pipe_pair();
        let id = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        let link = Link::connect_device(id, device_end, &self.config, entry.program)
            .map_err(into_transport)?;
        entry.sessions.push(link);
        debug!(
            device = %device.name,
            link = %id,
            program = %entry.program,
            "emulated session opened"
        );
        Ok(host_end)
    }

    fn boot(&self, device: &DeviceDescriptor, firmware: &[u8]) -> devlink_transport::Result<()> {
        let image = FirmwareImage::parse(firmware).map_err(|err| TransportError::Boot {
            device: device.name.clone(),
            reason: err.to_string(),
        })?;
        let mut devices = self.lock();
        let entry = devices
            .get_mut(&device.name)
            .ok_or_else(|| TransportError::DeviceNotFound(device.name.clone()))?;
        entry.state = DeviceState::Booted;
        entry.program = image.program;
        info!(device = %device.name, program = %image.program, "emulated device booted");
        Ok(())
    }
}

impl std::fmt::Debug for EmulatedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatedBus")
            .field("devices", &self.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

fn describe(name: &str, state: DeviceState) -> DeviceDescriptor {
    DeviceDescriptor {
        name: name.to_string(),
        protocol: Protocol::Emulated,
        platform: EmulatedBus::PLATFORM.to_string(),
        state,
    }
}

fn into_transport(err: LinkError) -> TransportError {
    match err {
        LinkError::Transport(err) => err,
        other => TransportError::Io(io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbooted_device_cannot_be_opened() {
        let bus = EmulatedBus::new();
        let dev = bus.add_device("emu-0");
        assert_eq!(dev.state, DeviceState::Unbooted);
        let err = bus.open(&dev).unwrap_err();
        assert!(matches!(err, TransportError::DeviceState { state: "unbooted", .. }));
    }

    #[test]
    fn boot_selects_program_and_marks_booted() {
        let bus = EmulatedBus::new();
        let dev = bus.add_device("emu-0");
        bus.boot(&dev, &FirmwareImage::new(DeviceProgram::Echo).to_bytes())
            .unwrap();
        let found = bus.discover().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].state, DeviceState::Booted);
        assert_eq!(found[0].platform, "emu");
    }

    #[test]
    fn bad_firmware_is_a_boot_error() {
        let bus = EmulatedBus::new();
        let dev = bus.add_device("emu-0");
        let err = bus.boot(&dev, b"not firmware").unwrap_err();
        assert!(matches!(err, TransportError::Boot { .. }));
        assert_eq!(bus.discover().unwrap()[0].state, DeviceState::Unbooted);
    }

    #[test]
    fn unknown_device_is_not_found() {
        let bus = EmulatedBus::new();
        let ghost = describe("ghost", DeviceState::Booted);
        assert!(matches!(
            bus.open(&ghost),
            Err(TransportError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn open_starts_a_device_session() {
        let bus = EmulatedBus::new();
        let dev = bus.add_booted_device("emu-0", DeviceProgram::Echo);
        let host_end = bus.open(&dev).unwrap();
        assert_eq!(host_end.transport_name(), "emulated");
        assert_eq!(bus.session_count("emu-0"), 1);
    }
}
