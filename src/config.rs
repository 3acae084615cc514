//! Configuration module for linkwatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::monitor::ScheduleSpec;

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Path to the SQLite database file (default: "linkwatch.db")
    pub db_path: String,
    /// Echo requests per probe (default: 5, 1 to 10)
    pub ping_count: u32,
    /// How long ping waits for each reply (default: 2s)
    pub ping_reply_timeout: Duration,
    /// Hard bound on one probe, process spawn included (default: 20s)
    pub probe_timeout: Duration,
    /// Upper bound of the random start delay of scheduled firings (default: 250ms)
    pub firing_jitter: Duration,
    /// When periodic reports run (default: none)
    pub report_schedule: Option<ScheduleSpec>,
    /// Span each periodic report covers (default: 3h)
    pub report_window: Duration,
    /// Periodic report recipients (default: none)
    pub report_recipients: Vec<String>,
    /// Recipients when every target was unreachable (default: none)
    pub error_recipients: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: "linkwatch.db".to_string(),
            ping_count: 5,
            ping_reply_timeout: Duration::from_millis(2000),
            probe_timeout: Duration::from_secs(20),
            firing_jitter: Duration::from_millis(250),
            report_schedule: None,
            report_window: Duration::from_secs(3 * 3600),
            report_recipients: Vec::new(),
            error_recipients: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LINKWATCH_DB_PATH`: Database file path (default: "linkwatch.db")
    /// - `LINKWATCH_PING_COUNT`: Echo requests per probe (default: 5)
    /// - `LINKWATCH_PING_REPLY_TIMEOUT_MS`: Per-reply wait (default: 2000)
    /// - `LINKWATCH_PROBE_TIMEOUT_SECS`: Probe time limit (default: 20)
    /// - `LINKWATCH_FIRING_JITTER_MS`: Scheduled firing jitter (default: 250)
    /// - `LINKWATCH_REPORT_SCHEDULE`: Periodic report schedule, e.g. `interval:3h`
    /// - `LINKWATCH_REPORT_WINDOW_HOURS`: Periodic report span (default: 3)
    /// - `LINKWATCH_REPORT_RECIPIENTS`: Comma-separated addresses
    /// - `LINKWATCH_ERROR_RECIPIENTS`: Comma-separated addresses for all-unreachable reports
    ///
    /// Unparseable values keep the default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("LINKWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(count) = parse_var::<u32>(&lookup, "LINKWATCH_PING_COUNT") {
            cfg.ping_count = count.clamp(1, 10);
        }
        if let Some(ms) = parse_var(&lookup, "LINKWATCH_PING_REPLY_TIMEOUT_MS") {
            cfg.ping_reply_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LINKWATCH_PROBE_TIMEOUT_SECS") {
            if secs > 0 {
                cfg.probe_timeout = Duration::from_secs(secs);
            }
        }
        if let Some(ms) = parse_var(&lookup, "LINKWATCH_FIRING_JITTER_MS") {
            cfg.firing_jitter = Duration::from_millis(ms);
        }
        if let Some(spec) = parse_var(&lookup, "LINKWATCH_REPORT_SCHEDULE") {
            cfg.report_schedule = Some(spec);
        }
        if let Some(hours) = parse_var::<u64>(&lookup, "LINKWATCH_REPORT_WINDOW_HOURS") {
            if hours > 0 {
                cfg.report_window = Duration::from_secs(hours * 3600);
            }
        }
        if let Some(list) = lookup("LINKWATCH_REPORT_RECIPIENTS") {
            cfg.report_recipients = split_list(&list);
        }
        if let Some(list) = lookup("LINKWATCH_ERROR_RECIPIENTS") {
            cfg.error_recipients = split_list(&list);
        }

        cfg
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "Ignoring unparseable configuration value");
            None
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
