use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use devlink_link::{DeviceProgram, Link, LinkConfig, LinkId, LinkState};
use devlink_transport::{TransportError, UnixDomainSocket};
use tracing::{info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{link_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let program = DeviceProgram::from(args.program);
    let config = LinkConfig::from_env().map_err(|err| link_error("invalid environment", err))?;

    let socket =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    // Polled so Ctrl-C is noticed between connections.
    socket
        .set_nonblocking(true)
        .map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut sessions: Vec<Arc<Link>> = Vec::new();
    let mut next_id = 0u32;
    info!(path = %args.path.display(), %program, "device serving");

    while running.load(Ordering::SeqCst) {
        if args.count.is_some_and(|max| next_id as usize >= max) {
            break;
        }
        match socket.accept() {
            Ok(stream) => {
                sessions.retain(|link| link.state() != LinkState::Closed);
                let id = LinkId(next_id);
                next_id += 1;
                match Link::connect_device(id, stream, &config, program) {
                    Ok(link) => {
                        info!(link = %id, active = sessions.len() + 1, "host connected");
                        sessions.push(link);
                    }
                    Err(err) => warn!(link = %id, error = %err, "device link failed to start"),
                }
            }
            Err(TransportError::Accept(err)) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(TransportError::Accept(err)) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(transport_error("accept failed", err)),
        }
    }

    // With --count, stay up until the last host is done.
    while running.load(Ordering::SeqCst)
        && sessions.iter().any(|link| link.state() != LinkState::Closed)
    {
        thread::sleep(POLL_INTERVAL);
    }

    info!(sessions = sessions.len(), "device stopping");
    for link in &sessions {
        let _ = link.reset();
    }
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
