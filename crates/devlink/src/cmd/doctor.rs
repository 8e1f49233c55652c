use std::sync::Arc;
use std::time::{Duration, Instant};

use devlink_link::{
    DeviceProgram, EmulatedBus, LinkConfig, LinkError, LinkManager, PacketLengthTarget,
};
use devlink_transport::DeviceRequirements;
use serde::Serialize;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

const LOOPBACK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Info,
    #[cfg_attr(unix, allow(dead_code))]
    Skip,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    kind: &'static str,
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(_args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        socket_bind_check(),
        emulated_loopback_check(),
        packet_length_env_check(),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| matches!(c.status, CheckStatus::Fail));
    let output = DoctorOutput {
        kind: "doctor-report",
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("devlink doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<20} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => println!("{}", output.overall),
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Info => "INFO",
        CheckStatus::Skip => "SKIP",
    }
}

fn socket_bind_check() -> CheckResult {
    #[cfg(unix)]
    {
        use std::path::PathBuf;
        use std::time::{SystemTime, UNIX_EPOCH};

        use devlink_transport::UnixDomainSocket;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir = PathBuf::from(format!("/tmp/devlink-doctor-{}-{nanos}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let outcome = UnixDomainSocket::bind(dir.join("doctor.sock")).map(drop);
        let _ = std::fs::remove_dir_all(&dir);

        match outcome {
            Ok(()) => CheckResult::new(
                "socket_bind",
                CheckStatus::Pass,
                "/tmp socket bind succeeded",
            ),
            Err(err) => CheckResult::new(
                "socket_bind",
                CheckStatus::Fail,
                format!("/tmp socket bind failed: {err}"),
            ),
        }
    }

    #[cfg(not(unix))]
    {
        CheckResult::new(
            "socket_bind",
            CheckStatus::Skip,
            "Unix domain sockets unavailable on this platform",
        )
    }
}

fn emulated_loopback_check() -> CheckResult {
    match loopback_round_trip() {
        Ok(rtt) => CheckResult::new(
            "emulated_loopback",
            CheckStatus::Pass,
            format!("echo round trip in {}us", rtt.as_micros()),
        ),
        Err(err) => CheckResult::new(
            "emulated_loopback",
            CheckStatus::Fail,
            format!("echo round trip failed: {err}"),
        ),
    }
}

fn loopback_round_trip() -> Result<Duration, LinkError> {
    let config = LinkConfig {
        connect_timeout: LOOPBACK_TIMEOUT,
        response_timeout: LOOPBACK_TIMEOUT,
        ..LinkConfig::default()
    };
    let bus = Arc::new(EmulatedBus::with_config(config.clone()));
    bus.add_booted_device("doctor", DeviceProgram::Echo);
    let manager = LinkManager::new(config);
    manager.register_backend(bus);
    manager.initialize()?;

    let link = manager.link(manager.connect(&DeviceRequirements::named("doctor"))?)?;
    let stream = link.open_stream("doctor", 64)?;
    let start = Instant::now();
    link.write(stream, b"doctor")?;
    let packet = link.read_timeout(stream, LOOPBACK_TIMEOUT)?;
    let rtt = start.elapsed();
    link.release(stream)?;
    manager.reset_all()?;

    if &packet.data[..] != b"doctor" {
        return Err(LinkError::InvalidState(
            "echoed payload does not match".to_string(),
        ));
    }
    Ok(rtt)
}

fn packet_length_env_check() -> CheckResult {
    match LinkConfig::from_env() {
        Ok(config) => CheckResult::new(
            "packet_length_env",
            CheckStatus::Pass,
            format!(
                "host={} device={}",
                config.packet_length(PacketLengthTarget::Host),
                config.packet_length(PacketLengthTarget::Device)
            ),
        ),
        Err(err) => CheckResult::new("packet_length_env", CheckStatus::Fail, err.to_string()),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = vec!["emulated"];
    if cfg!(unix) {
        features.push("uds");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }
    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            kind: "doctor-report",
            checks: vec![CheckResult::new("x", CheckStatus::Pass, "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[test]
    fn loopback_check_passes() {
        let check = emulated_loopback_check();
        assert!(matches!(check.status, CheckStatus::Pass), "{}", check.detail);
    }
}
