//! Firmware images understood by emulated devices.
//!
//! Layout: `"DLFW"` magic, one version byte, then the UTF-8 name of the
//! program the device runs once booted.

use std::fmt;

use crate::error::{LinkError, Result};

pub const FIRMWARE_MAGIC: &[u8; 4] = b"DLFW";
pub const FIRMWARE_VERSION: u8 = 1;

/// Behaviour of a device-role link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceProgram {
    /// Queue inbound packets for a local reader.
    #[default]
    Idle,
    /// Write every inbound packet back on its stream, then release it.
    Echo,
}

impl DeviceProgram {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceProgram::Idle => "idle",
            DeviceProgram::Echo => "echo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "idle" => Some(DeviceProgram::Idle),
            "echo" => Some(DeviceProgram::Echo),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareImage {
    pub version: u8,
    pub program: DeviceProgram,
}

impl FirmwareImage {
    pub fn new(program: DeviceProgram) -> Self {
        Self {
            version: FIRMWARE_VERSION,
            program,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let rest = bytes.strip_prefix(FIRMWARE_MAGIC).ok_or_else(|| {
            LinkError::InvalidArgument("firmware image does not start with DLFW".to_string())
        })?;
        let (&version, name) = rest.split_first().ok_or_else(|| {
            LinkError::InvalidArgument("firmware image is truncated".to_string())
        })?;
        if version != FIRMWARE_VERSION {
            return Err(LinkError::InvalidArgument(format!(
                "unsupported firmware version {version}"
            )));
        }
        let name = std::str::from_utf8(name).map_err(|_| {
            LinkError::InvalidArgument("firmware program name is not UTF-8".to_string())
        })?;
        let program = DeviceProgram::from_name(name).ok_or_else(|| {
            LinkError::InvalidArgument(format!("unknown firmware program {name:?}"))
        })?;
        Ok(Self { version, program })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.program.as_str().len());
        out.extend_from_slice(FIRMWARE_MAGIC);
        out.push(self.version);
        out.extend_from_slice(self.program.as_str().as_bytes());
        out
    }
}
