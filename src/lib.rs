//! linkwatch - router availability monitoring.
//!
//! Probes routers and their ISP uplinks with the system `ping` utility on
//! per-router schedules, stores every outcome in SQLite and builds
//! aggregate reports over arbitrary time windows.

pub mod config;
pub mod db;
pub mod monitor;
pub mod probe;
pub mod report;
pub mod scheduler;
