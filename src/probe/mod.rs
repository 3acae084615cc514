//! Probe module for router availability monitoring.
//!
//! Shells out to the platform `ping` utility and normalizes its output.

mod parse;
mod ping;

pub use parse::*;
pub use ping::*;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Probe error types.
///
/// Every variant means the same thing to the monitor: the target could not
/// be confirmed reachable during this firing.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("command failed: {0}")]
    Command(String),
    #[error("ping exited with {status}")]
    Unreachable { status: String, output: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Operating system family, which decides both the ping flag syntax and
/// the output grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Windows,
    MacOs,
    Linux,
}

impl OsFamily {
    /// The family of the host this binary was built for.
    ///
    /// BSDs share the macOS ping dialect; every other Unix is treated as Linux.
    pub fn detect() -> Self {
        if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly"
        )) {
            OsFamily::MacOs
        } else {
            OsFamily::Linux
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsFamily::Windows => "windows",
            OsFamily::MacOs => "macos",
            OsFamily::Linux => "linux",
        };
        f.write_str(name)
    }
}

/// Captured stdout of one successful ping invocation.
#[derive(Debug, Clone)]
pub struct RawProbeOutput {
    pub os: OsFamily,
    pub stdout: String,
}

impl RawProbeOutput {
    /// Parse the captured text with the grammar of the producing OS.
    pub fn statistics(&self) -> PingStatistics {
        parse_ping_output(&self.stdout, self.os)
    }
}

/// Something that can probe a single address.
///
/// The monitor only depends on this trait so tests can substitute canned
/// outputs for real child processes.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str) -> Result<RawProbeOutput, ProbeError>;
}

/// Normalized outcome of one probe, ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeMeasurement {
    pub successful: bool,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: f64,
}

impl ProbeMeasurement {
    /// A probe that produced no usable answer.
    pub fn unreachable() -> Self {
        Self {
            successful: false,
            latency_ms: None,
            jitter_ms: None,
            packet_loss_pct: 100.0,
        }
    }

    /// Fold a probe outcome into a measurement. Inability to run the probe
    /// is indistinguishable from an unreachable target.
    pub fn from_outcome(outcome: &Result<RawProbeOutput, ProbeError>) -> Self {
        let raw = match outcome {
            Ok(raw) => raw,
            Err(_) => return Self::unreachable(),
        };

        // No round-trip summary means no echo came back, whatever loss
        // figure the utility printed.
        let stats = raw.statistics();
        if !stats.is_reachable() {
            return Self::unreachable();
        }

        Self {
            successful: true,
            latency_ms: Some(stats.avg_ms),
            jitter_ms: Some(stats.jitter_ms),
            packet_loss_pct: stats.packet_loss_pct,
        }
    }
}
