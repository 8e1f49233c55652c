use std::fs;
use std::sync::Arc;
use std::time::Duration;

use devlink_frame::ALIGNMENT;
use devlink_link::{parse_packet_length, LinkConfig, LinkManager, PacketLengthTarget};
use devlink_transport::{DeviceRequirements, Protocol, UdsBackend};
use tracing::debug;

use crate::cmd::SendArgs;
use crate::exit::{link_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_packet, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let payload = resolve_payload(&args)?;
    let size = stream_size(args.size, payload.len())?;

    let mut config =
        LinkConfig::from_env().map_err(|err| link_error("invalid environment", err))?;
    config.connect_timeout = timeout;
    config.response_timeout = timeout;
    if let Some(raw) = &args.packet_length {
        let len =
            parse_packet_length(raw).map_err(|err| link_error("invalid --packet-length", err))?;
        config = config
            .with_packet_length(PacketLengthTarget::Host, len)
            .with_packet_length(PacketLengthTarget::Device, len);
    }

    let manager = LinkManager::new(config);
    manager.register_backend(Arc::new(UdsBackend::new([args.path.clone()])));
    manager
        .initialize()
        .map_err(|err| link_error("initialize failed", err))?;

    let requirements = DeviceRequirements::named(args.path.display().to_string())
        .with_protocol(Protocol::Ipc);
    let id = manager
        .connect(&requirements)
        .map_err(|err| link_error("connect failed", err))?;
    let link = manager
        .link(id)
        .map_err(|err| link_error("connect failed", err))?;

    let stream = link
        .open_stream(&args.stream, size)
        .map_err(|err| link_error("open stream failed", err))?;
    link.write_timeout(stream, &payload, timeout)
        .map_err(|err| link_error("write failed", err))?;
    debug!(stream = %stream, size = payload.len(), "packet sent");

    if args.read {
        let packet = link
            .read_timeout(stream, timeout)
            .map_err(|err| link_error("read failed", err))?;
        print_packet(&packet, &args.stream, format);
        link.release(stream)
            .map_err(|err| link_error("release failed", err))?;
    }

    if let Err(err) = link.close_stream(stream) {
        debug!(error = %err, "stream close failed");
    }
    manager
        .reset(id)
        .map_err(|err| link_error("reset failed", err))?;
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}

/// Requested stream size, or the smallest one that holds the payload.
fn stream_size(requested: Option<u32>, payload_len: usize) -> CliResult<u32> {
    if let Some(size) = requested {
        if size == 0 {
            return Err(CliError::new(USAGE, "--size must be greater than zero"));
        }
        return Ok(size);
    }
    u32::try_from(payload_len.max(ALIGNMENT)).map_err(|_| {
        CliError::new(
            DATA_INVALID,
            format!("payload of {payload_len} bytes is too large for one stream"),
        )
    })
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn default_stream_size_fits_payload() {
        assert_eq!(stream_size(None, 0).unwrap(), 64);
        assert_eq!(stream_size(None, 600).unwrap(), 600);
        assert_eq!(stream_size(Some(1000), 10).unwrap(), 1000);
        assert_eq!(stream_size(Some(0), 10).unwrap_err().code, USAGE);
    }
}
