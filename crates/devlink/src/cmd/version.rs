use devlink_frame::{DEFAULT_PACKET_LENGTH, HEADER_SIZE};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("devlink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: devlink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("DEVLINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "build_profile: {}",
        option_env!("DEVLINK_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("wire_header_bytes: {HEADER_SIZE}");
    println!("default_packet_length: {DEFAULT_PACKET_LENGTH}");
    println!("transports: {}", transports().join(", "));

    Ok(SUCCESS)
}

fn transports() -> Vec<&'static str> {
    let mut out = vec!["emulated"];
    if cfg!(unix) {
        out.push("unix-domain-socket");
    }
    out
}
