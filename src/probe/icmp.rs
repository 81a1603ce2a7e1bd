use super::{Probe, ProbeOutcome};
use crate::address::AddressKey;
use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::IpAddr;
use std::num::NonZeroU8;
use std::process::Stdio;
use std::time::Duration;
use tokio::{process::Command, time};

/// Budget of one `ping` run, including process start-up.
const PING_TIMEOUT: Duration = Duration::from_millis(1500);

static RTT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time[=<]\s*([\d.]+)\s*ms").expect("RTT pattern is valid"));

/// Sends one echo request through the system `ping` and reads the round-trip
/// time from its output. The target port is ignored.
#[derive(Debug, Clone)]
pub struct IcmpProbe {
    timeout: Duration,
}

impl IcmpProbe {
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for IcmpProbe {
    fn default() -> Self {
        Self::new(PING_TIMEOUT)
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    async fn probe(&self, target: &AddressKey) -> ProbeOutcome {
        let (program, args) = ping_command(target.ip());
        let mut command = Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!("{program} {} exited with {}", target.ip(), output.status);
                return ProbeOutcome::failed();
            }
            Ok(Err(e)) => {
                debug!("Could not run {program}: {e}");
                return ProbeOutcome::failed();
            }
            Err(_) => {
                debug!("{program} {} timed out", target.ip());
                return ProbeOutcome::failed();
            }
        };

        parse_rtt(&String::from_utf8_lossy(&output.stdout))
            .map_or_else(ProbeOutcome::failed, ProbeOutcome::reached)
    }

    /// Echo requests are sent once per target whatever the configured count.
    fn attempts(&self, _configured: NonZeroU8) -> NonZeroU8 {
        NonZeroU8::MIN
    }
}

/// Program and arguments sending a single echo request to `ip` on this platform.
pub fn ping_command(ip: IpAddr) -> (&'static str, Vec<String>) {
    let target = ip.to_string();
    let (program, flags): (&str, &[&str]) = if cfg!(windows) {
        ("ping", &["-n", "1", "-w", "1000"])
    } else if cfg!(target_os = "macos") {
        match ip {
            IpAddr::V4(_) => ("ping", &["-c", "1", "-t", "1"]),
            IpAddr::V6(_) => ("ping6", &["-c", "1"]),
        }
    } else {
        match ip {
            IpAddr::V4(_) => ("ping", &["-c", "1", "-W", "1"]),
            IpAddr::V6(_) => ("ping6", &["-c", "1", "-W", "1"]),
        }
    };

    let args = flags
        .iter()
        .map(|&flag| flag.to_owned())
        .chain(std::iter::once(target))
        .collect();
    (program, args)
}

/// Reads the first `time=<float> ms` sample of a `ping` output.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn parse_rtt(output: &str) -> Option<Duration> {
    let captures = RTT_PATTERN.captures(output)?;
    let millis: f64 = captures.get(1)?.as_str().parse().ok()?;
    if !millis.is_finite() || millis <= 0.0 {
        return None;
    }
    Some(Duration::from_micros((millis * 1000.0).round() as u64))
}
