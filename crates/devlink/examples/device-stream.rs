//! A device-initiated stream between two links joined by an emulated pipe.
//!
//! The device opens a stream, the host adopts the id it assigned, and
//! telemetry flows device to host.
//!
//! Run with: `cargo run -p devlink --example device-stream`

use std::thread;

use devlink::transport::pipe_pair;
use devlink::{DeviceProgram, Link, LinkConfig, LinkError, LinkId, LinkRole};

fn main() -> Result<(), LinkError> {
    let (host_end, device_end) = pipe_pair();
    let config = LinkConfig::default();

    let host = Link::connect_stream(LinkId(0), host_end, LinkRole::Host, &config)?;
    let device = Link::connect_device(LinkId(1), device_end, &config, DeviceProgram::Idle)?;

    let producer = {
        let device = device.clone();
        thread::spawn(move || -> Result<(), LinkError> {
            let stream = device.open_stream("telemetry", 4096)?;
            for i in 0..5u32 {
                device.write(stream, format!("sample {i}").as_bytes())?;
            }
            Ok(())
        })
    };

    let stream = host.open_stream("telemetry", 4096)?;
    for _ in 0..5 {
        let packet = host.read(stream)?;
        println!("{}", String::from_utf8_lossy(&packet.data));
        host.release(stream)?;
    }

    producer
        .join()
        .map_err(|_| LinkError::InvalidState("producer panicked".to_string()))??;
    host.reset()?;
    device.reset()
}
