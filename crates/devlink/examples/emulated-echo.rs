//! Echo packets through an emulated device.
//!
//! Run with: `cargo run -p devlink --example emulated-echo`

use std::sync::Arc;

use devlink::{
    DeviceProgram, DeviceRequirements, EmulatedBus, FillSide, LinkConfig, LinkError, LinkManager,
};

fn main() -> Result<(), LinkError> {
    let bus = Arc::new(EmulatedBus::new());
    bus.add_booted_device("emu-0", DeviceProgram::Echo);

    let manager = LinkManager::new(LinkConfig::default());
    manager.register_backend(bus);
    manager.initialize()?;

    let link = manager.link(manager.connect(&DeviceRequirements::default())?)?;
    let stream = link.open_stream("A", 1000)?;
    println!(
        "opened stream {stream} with capacity {}",
        link.stream_capacity(stream)?
    );

    for msg in ["first", "second", "third"] {
        link.write(stream, msg.as_bytes())?;
    }
    println!(
        "local fill after three echoes: {}",
        link.fill_level(stream, FillSide::Local)?
    );

    for _ in 0..3 {
        let packet = link.read(stream)?;
        println!(
            "packet {}: {}",
            packet.id,
            String::from_utf8_lossy(&packet.data)
        );
        link.release(stream)?;
    }

    link.close_stream(stream)?;
    manager.reset_all()
}
