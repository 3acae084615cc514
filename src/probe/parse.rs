//! Ping output parsing for the three supported dialects.
//!
//! Parsing is total: text that does not match the expected summary lines
//! yields a total-loss record instead of an error.

use std::sync::OnceLock;

use regex::Regex;

use super::OsFamily;

/// Summary statistics extracted from one ping invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStatistics {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    /// `mdev`/`stddev` when the utility reports one, else `max - min`.
    pub jitter_ms: f64,
    /// Always within `0.0..=100.0`.
    pub packet_loss_pct: f64,
    /// Whether a round-trip summary line was found.
    pub rtt_reported: bool,
}

impl PingStatistics {
    pub fn total_loss() -> Self {
        Self {
            min_ms: 0.0,
            avg_ms: 0.0,
            max_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss_pct: 100.0,
            rtt_reported: false,
        }
    }

    /// At least one echo reply came back with timing information.
    pub fn is_reachable(&self) -> bool {
        self.rtt_reported && self.packet_loss_pct < 100.0
    }

    fn with_loss(loss: f64) -> Self {
        Self {
            packet_loss_pct: loss.clamp(0.0, 100.0),
            ..Self::total_loss()
        }
    }

    fn with_round_trip(mut self, min: f64, avg: f64, max: f64, deviation: Option<f64>) -> Self {
        if self.packet_loss_pct >= 100.0 {
            return self;
        }
        self.min_ms = min;
        self.avg_ms = avg;
        self.max_ms = max;
        self.jitter_ms = deviation.unwrap_or((max - min).max(0.0));
        self.rtt_reported = true;
        self
    }
}

/// Parse raw ping output using the grammar of the given OS family.
pub fn parse_ping_output(output: &str, os: OsFamily) -> PingStatistics {
    match os {
        OsFamily::Windows => parse_windows(output),
        OsFamily::MacOs => parse_macos(output),
        OsFamily::Linux => parse_linux(output),
    }
}

fn capture_f64(caps: &regex::Captures<'_>, idx: usize) -> Option<f64> {
    caps.get(idx)?.as_str().parse::<f64>().ok()
}

/// `Packets: Sent = 4, Received = 3, Lost = 1 (25% loss),`
/// `Minimum = 14ms, Maximum = 16ms, Average = 15ms`
pub fn parse_windows(output: &str) -> PingStatistics {
    static LOSS: OnceLock<Regex> = OnceLock::new();
    static COUNTS: OnceLock<Regex> = OnceLock::new();
    static RTT: OnceLock<Regex> = OnceLock::new();

    let loss_re = LOSS.get_or_init(|| Regex::new(r"\((\d+(?:\.\d+)?)%\s*loss\)").unwrap());
    let counts_re =
        COUNTS.get_or_init(|| Regex::new(r"Sent\s*=\s*(\d+),\s*Received\s*=\s*(\d+)").unwrap());
    let rtt_re = RTT.get_or_init(|| {
        Regex::new(r"Minimum\s*=\s*(\d+(?:\.\d+)?)ms,\s*Maximum\s*=\s*(\d+(?:\.\d+)?)ms,\s*Average\s*=\s*(\d+(?:\.\d+)?)ms")
            .unwrap()
    });

    let loss = loss_re
        .captures(output)
        .and_then(|caps| capture_f64(&caps, 1))
        .or_else(|| {
            let caps = counts_re.captures(output)?;
            let sent = capture_f64(&caps, 1)?;
            let received = capture_f64(&caps, 2)?;
            (sent > 0.0).then(|| (sent - received) / sent * 100.0)
        });

    let Some(loss) = loss else {
        return PingStatistics::total_loss();
    };
    let stats = PingStatistics::with_loss(loss);

    match rtt_re.captures(output) {
        Some(caps) => match (capture_f64(&caps, 1), capture_f64(&caps, 2), capture_f64(&caps, 3)) {
            // Windows reports no deviation, so jitter falls back to the range.
            (Some(min), Some(max), Some(avg)) => stats.with_round_trip(min, avg, max, None),
            _ => stats,
        },
        None => stats,
    }
}

/// `4 packets transmitted, 4 packets received, 0.0% packet loss`
/// `round-trip min/avg/max/stddev = 1.1/2.2/3.3/0.4 ms`
pub fn parse_macos(output: &str) -> PingStatistics {
    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt_re = RTT.get_or_init(|| {
        Regex::new(
            r"round-trip\s+min/avg/max(?:/(?:stddev|std-dev))?\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)(?:/([0-9.]+))?",
        )
        .unwrap()
    });
    parse_unix(output, rtt_re)
}

/// `5 packets transmitted, 4 received, 20% packet loss, time 4005ms`
/// `rtt min/avg/max/mdev = 1.100/2.200/3.300/0.400 ms`
///
/// Busybox prints `round-trip min/avg/max = ...` without a deviation.
pub fn parse_linux(output: &str) -> PingStatistics {
    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt_re = RTT.get_or_init(|| {
        Regex::new(
            r"(?:rtt|round-trip)\s+min/avg/max(?:/mdev)?\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)(?:/([0-9.]+))?",
        )
        .unwrap()
    });
    parse_unix(output, rtt_re)
}

fn parse_unix(output: &str, rtt_re: &Regex) -> PingStatistics {
    static LOSS: OnceLock<Regex> = OnceLock::new();
    let loss_re = LOSS.get_or_init(|| Regex::new(r"([0-9.]+)%\s+packet\s+loss").unwrap());

    let Some(loss) = loss_re
        .captures(output)
        .and_then(|caps| capture_f64(&caps, 1))
    else {
        return PingStatistics::total_loss();
    };
    let stats = PingStatistics::with_loss(loss);

    let Some(caps) = rtt_re.captures(output) else {
        return stats;
    };
    match (capture_f64(&caps, 1), capture_f64(&caps, 2), capture_f64(&caps, 3)) {
        (Some(min), Some(avg), Some(max)) => {
            stats.with_round_trip(min, avg, max, capture_f64(&caps, 4))
        }
        _ => stats,
    }
}
