//! Ping probe implementation that shells out to the system `ping` utility.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{OsFamily, ProbeError, Prober, RawProbeOutput};

/// Runs the host `ping` binary with a fixed echo count and a hard timeout.
#[derive(Debug, Clone)]
pub struct PingProber {
    os: OsFamily,
    count: u32,
    reply_timeout: Duration,
    timeout: Duration,
}

impl PingProber {
    /// `reply_timeout` bounds each echo, `timeout` bounds the whole call.
    pub fn new(count: u32, reply_timeout: Duration, timeout: Duration) -> Self {
        Self {
            os: OsFamily::detect(),
            count: count.max(1),
            reply_timeout,
            timeout,
        }
    }

    pub fn os(&self) -> OsFamily {
        self.os
    }
}

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: &str) -> Result<RawProbeOutput, ProbeError> {
        let args = ping_args(self.os, self.count, self.reply_timeout, address)?;

        let child = Command::new("ping")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            return Err(ProbeError::Unreachable {
                status: output.status.to_string(),
                output: stdout,
            });
        }

        Ok(RawProbeOutput {
            os: self.os,
            stdout,
        })
    }
}

/// Build the argument list for one invocation.
///
/// Addresses are passed as a single argv entry, never through a shell; a
/// leading `-` is rejected so an address cannot smuggle in an option.
pub fn ping_args(
    os: OsFamily,
    count: u32,
    reply_timeout: Duration,
    address: &str,
) -> Result<Vec<String>, ProbeError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(ProbeError::Config("empty address".to_string()));
    }
    if address.starts_with('-') || address.chars().any(char::is_whitespace) {
        return Err(ProbeError::Config(format!("invalid address: {}", address)));
    }

    let count = count.to_string();
    let reply_ms = reply_timeout.as_millis().max(1);

    let mut args = match os {
        OsFamily::Windows => vec!["-n".to_string(), count, "-w".to_string(), reply_ms.to_string()],
        // BSD ping takes the per-reply wait in milliseconds.
        OsFamily::MacOs => vec!["-c".to_string(), count, "-W".to_string(), reply_ms.to_string()],
        // iputils takes whole seconds; -n skips reverse DNS.
        OsFamily::Linux => {
            let reply_secs = reply_timeout.as_secs().max(1);
            vec![
                "-n".to_string(),
                "-c".to_string(),
                count,
                "-W".to_string(),
                reply_secs.to_string(),
            ]
        }
    };
    args.push(address.to_string());
    Ok(args)
}
