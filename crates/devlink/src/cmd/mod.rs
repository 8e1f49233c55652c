use clap::{Args, Subcommand, ValueEnum};
use std::path::PathBuf;

use devlink_link::DeviceProgram;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod doctor;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an emulated device on a Unix socket.
    Serve(ServeArgs),
    /// Connect to a device, write one packet and optionally read the reply.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
    }
}

/// Firmware program a served device runs.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum ProgramArg {
    /// Write every packet back on its stream.
    #[default]
    Echo,
    /// Accept packets and keep them queued.
    Idle,
}

impl From<ProgramArg> for DeviceProgram {
    fn from(arg: ProgramArg) -> Self {
        match arg {
            ProgramArg::Echo => DeviceProgram::Echo,
            ProgramArg::Idle => DeviceProgram::Idle,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Program the device runs on every link.
    #[arg(long, value_enum, default_value = "echo")]
    pub program: ProgramArg,
    /// Stop accepting after N hosts and exit once their links close.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Device socket path to connect to.
    pub path: PathBuf,
    /// Stream name to open.
    #[arg(long, short = 's', default_value = "data")]
    pub stream: String,
    /// Raw string payload.
    #[arg(long, conflicts_with = "file")]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with = "data")]
    pub file: Option<PathBuf>,
    /// Stream buffer size in bytes (rounded up to 64). Default: fits the payload.
    #[arg(long)]
    pub size: Option<u32>,
    /// Wait for one packet on the stream and print it.
    #[arg(long)]
    pub read: bool,
    /// Packet length for both directions (positive multiple of 1024).
    #[arg(long, value_name = "BYTES")]
    pub packet_length: Option<String>,
    /// Connect, write and read timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}
