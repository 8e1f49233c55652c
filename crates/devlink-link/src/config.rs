//! Link configuration and validation of human-supplied values.

use std::time::Duration;

use devlink_frame::{validate_packet_length, DEFAULT_MAX_PAYLOAD, DEFAULT_PACKET_LENGTH};

use crate::error::{LinkError, Result};
use crate::types::PacketLengthTarget;

pub const ENV_HOST_PACKET_LENGTH: &str = "DEVLINK_HOST_PACKET_LENGTH";
pub const ENV_DEVICE_PACKET_LENGTH: &str = "DEVLINK_DEVICE_PACKET_LENGTH";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "DEVLINK_CONNECT_TIMEOUT_MS";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_STREAMS: usize = 32;
pub const DEFAULT_MAX_LINKS: usize = 32;

/// Parse a packet length given as text, e.g. from the environment or a flag.
///
/// Accepts positive multiples of 1024.
pub fn parse_packet_length(value: &str) -> Result<u32> {
    let trimmed = value.trim();
    let parsed: i64 = trimmed.parse().map_err(|_| {
        LinkError::InvalidConfiguration(format!(
            "unexpected packet length \"{value}\", must be a number"
        ))
    })?;
    if parsed <= 0 {
        return Err(LinkError::InvalidConfiguration(format!(
            "unexpected packet length \"{value}\", only positive numbers are supported"
        )));
    }
    u32::try_from(parsed)
        .ok()
        .filter(|len| validate_packet_length(*len).is_ok())
        .ok_or_else(|| {
            LinkError::InvalidConfiguration(format!(
                "unexpected packet length \"{value}\", value should be multiple of 1024"
            ))
        })
}

/// Configuration shared by every link a manager creates.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Chunk size for host-to-device data.
    pub host_packet_length: u32,
    /// Chunk size for device-to-host data, announced to the device on connect.
    pub device_packet_length: u32,
    /// Bound on transport open plus the liveness ping.
    pub connect_timeout: Duration,
    /// Bound on waiting for a peer response (open, ping, write acknowledgement).
    pub response_timeout: Duration,
    pub max_streams: usize,
    pub max_links: usize,
    /// Largest packet accepted in one write or reassembled on receive.
    pub max_packet_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host_packet_length: DEFAULT_PACKET_LENGTH,
            device_packet_length: DEFAULT_PACKET_LENGTH,
            connect_timeout: DEFAULT_TIMEOUT,
            response_timeout: DEFAULT_TIMEOUT,
            max_streams: DEFAULT_MAX_STREAMS,
            max_links: DEFAULT_MAX_LINKS,
            max_packet_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl LinkConfig {
    /// Defaults overridden by `DEVLINK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_HOST_PACKET_LENGTH) {
            config.host_packet_length = parse_packet_length(&value)?;
        }
        if let Some(value) = lookup(ENV_DEVICE_PACKET_LENGTH) {
            config.device_packet_length = parse_packet_length(&value)?;
        }
        if let Some(value) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            let ms: u64 = value.trim().parse().map_err(|_| {
                LinkError::InvalidConfiguration(format!(
                    "{ENV_CONNECT_TIMEOUT_MS}=\"{value}\" must be a number of milliseconds"
                ))
            })?;
            config.connect_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_packet_length(mut self, target: PacketLengthTarget, len: u32) -> Self {
        match target {
            PacketLengthTarget::Host => self.host_packet_length = len,
            PacketLengthTarget::Device => self.device_packet_length = len,
        }
        self
    }

    pub fn packet_length(&self, target: PacketLengthTarget) -> u32 {
        match target {
            PacketLengthTarget::Host => self.host_packet_length,
            PacketLengthTarget::Device => self.device_packet_length,
        }
    }

    /// Reject settings no link could run with.
    pub fn validate(&self) -> Result<()> {
        validate_packet_length(self.host_packet_length)?;
        validate_packet_length(self.device_packet_length)?;
        if self.max_streams == 0 || self.max_links == 0 {
            return Err(LinkError::InvalidConfiguration(
                "max_streams and max_links must be at least 1".to_string(),
            ));
        }
        if self.max_packet_size == 0 {
            return Err(LinkError::InvalidConfiguration(
                "max_packet_size must be positive".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(LinkError::InvalidConfiguration(
                "timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::error::ErrorKind;

    fn message(err: LinkError) -> String {
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        err.to_string()
    }

    #[test]
    fn packet_length_accepts_multiples_of_1024() {
        assert_eq!(parse_packet_length("1024").unwrap(), 1024);
        assert_eq!(parse_packet_length("65536").unwrap(), 65536);
        assert_eq!(parse_packet_length(" 2048 ").unwrap(), 2048);
    }

    #[test]
    fn packet_length_error_messages() {
        assert!(message(parse_packet_length("abc").unwrap_err()).contains("must be a number"));
        assert!(message(parse_packet_length("0").unwrap_err())
            .contains("only positive numbers are supported"));
        assert!(message(parse_packet_length("-1024").unwrap_err())
            .contains("only positive numbers are supported"));
        assert!(message(parse_packet_length("1500").unwrap_err())
            .contains("value should be multiple of 1024"));
    }

    #[test]
    fn default_config_is_valid() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.host_packet_length, 64 * 1024);
        assert_eq!(config.max_streams, 32);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let env: HashMap<&str, &str> = [
            (ENV_HOST_PACKET_LENGTH, "1024"),
            (ENV_DEVICE_PACKET_LENGTH, "4096"),
            (ENV_CONNECT_TIMEOUT_MS, "250"),
        ]
        .into_iter()
        .collect();

        let config = LinkConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.packet_length(PacketLengthTarget::Host), 1024);
        assert_eq!(config.packet_length(PacketLengthTarget::Device), 4096);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn lookup_rejects_bad_values() {
        let err = LinkConfig::from_lookup(|k| {
            (k == ENV_DEVICE_PACKET_LENGTH).then(|| "1500".to_string())
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn zero_limits_rejected() {
        let config = LinkConfig {
            max_streams: 0,
            ..LinkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
