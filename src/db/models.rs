//! Database model types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::monitor::ScheduleSpec;
use crate::probe::ProbeMeasurement;
use crate::report::AggregateStats;

/// Statistics key reserved for a router's primary address.
pub const MAIN_CONNECTION: &str = "main";

/// A monitored router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub id: i64,
    pub name: String,
    /// Primary address, probed with no connection label.
    pub address: String,
    pub monitoring_enabled: bool,
    pub schedule: Option<ScheduleSpec>,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            monitoring_enabled: false,
            schedule: None,
        }
    }
}

impl Router {
    /// The schedule to run, if monitoring is enabled and one is configured.
    pub fn active_schedule(&self) -> Option<&ScheduleSpec> {
        if self.monitoring_enabled {
            self.schedule.as_ref()
        } else {
            None
        }
    }

    /// Probe targets in firing order: the primary address first, then each
    /// active ISP connection in the order given.
    pub fn targets(&self, connections: &[IspConnection]) -> Vec<MonitoredTarget> {
        let mut targets = vec![MonitoredTarget {
            address: self.address.clone(),
            connection_label: None,
            active: true,
        }];
        targets.extend(
            connections
                .iter()
                .filter(|c| c.router_id == self.id)
                .map(IspConnection::target)
                .filter(|t| t.active),
        );
        targets
    }
}

/// An ISP uplink belonging to a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IspConnection {
    pub id: i64,
    pub router_id: i64,
    pub name: String,
    pub address: String,
    pub active: bool,
}

impl Default for IspConnection {
    fn default() -> Self {
        Self {
            id: 0,
            router_id: 0,
            name: String::new(),
            address: String::new(),
            active: true,
        }
    }
}

impl IspConnection {
    pub fn target(&self) -> MonitoredTarget {
        MonitoredTarget {
            address: self.address.clone(),
            connection_label: Some(self.name.clone()),
            active: self.active,
        }
    }
}

/// An address to probe. Derived from routers and connections, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredTarget {
    pub address: String,
    /// `None` for a router's primary address.
    pub connection_label: Option<String>,
    pub active: bool,
}

/// One stored probe outcome. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: i64,
    pub router_id: i64,
    pub address: String,
    pub timestamp: DateTime<Utc>,
    pub successful: bool,
    pub latency_ms: Option<f64>,
    /// 0 to 100; 100 when the probe failed outright.
    pub packet_loss_pct: f64,
    pub jitter_ms: Option<f64>,
    pub connection_label: Option<String>,
}

impl ProbeResult {
    /// A new, not yet stored result timestamped now.
    pub fn new(router_id: i64, target: &MonitoredTarget, measurement: ProbeMeasurement) -> Self {
        Self {
            id: 0,
            router_id,
            address: target.address.clone(),
            timestamp: Utc::now(),
            successful: measurement.successful,
            latency_ms: measurement.latency_ms,
            packet_loss_pct: measurement.packet_loss_pct.clamp(0.0, 100.0),
            jitter_ms: measurement.jitter_ms,
            connection_label: target.connection_label.clone(),
        }
    }

    /// Statistics key: the connection label, or `"main"` for the primary address.
    pub fn connection_key(&self) -> &str {
        self.connection_label.as_deref().unwrap_or(MAIN_CONNECTION)
    }
}

/// A generated performance report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: i64,
    pub router_id: i64,
    pub title: String,
    pub message: Option<String>,
    pub time_range_start: DateTime<Utc>,
    pub time_range_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub statistics_by_connection: BTreeMap<String, AggregateStats>,
    pub email_sent: bool,
    pub recipients: Vec<String>,
}

impl Report {
    /// True when the window holds results and none of them succeeded.
    pub fn all_unreachable(&self) -> bool {
        let tested = self
            .statistics_by_connection
            .values()
            .any(|s| s.total_tests > 0);
        tested
            && self
                .statistics_by_connection
                .values()
                .all(|s| s.successful_tests == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(id: i64, name: &str, active: bool) -> IspConnection {
        IspConnection {
            id,
            router_id: 1,
            name: name.to_string(),
            address: format!("10.0.{}.1", id),
            active,
        }
    }

    #[test]
    fn test_targets_primary_first_and_skip_inactive() {
        let router = Router {
            id: 1,
            name: "edge".to_string(),
            address: "192.168.1.1".to_string(),
            ..Default::default()
        };
        let connections = vec![
            connection(1, "fiber", true),
            connection(2, "backup", false),
            connection(3, "lte", true),
        ];

        let targets = router.targets(&connections);
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].address, "192.168.1.1");
        assert_eq!(targets[0].connection_label, None);
        assert_eq!(targets[1].connection_label.as_deref(), Some("fiber"));
        assert_eq!(targets[2].connection_label.as_deref(), Some("lte"));
    }

    #[test]
    fn test_active_schedule_requires_enabled() {
        let mut router = Router {
            schedule: Some("interval:5m".parse().unwrap()),
            ..Default::default()
        };
        assert!(router.active_schedule().is_none());
        router.monitoring_enabled = true;
        assert!(router.active_schedule().is_some());
    }

    #[test]
    fn test_connection_key() {
        let target = MonitoredTarget {
            address: "10.0.0.1".to_string(),
            connection_label: None,
            active: true,
        };
        let result = ProbeResult::new(1, &target, ProbeMeasurement::unreachable());
        assert_eq!(result.connection_key(), MAIN_CONNECTION);
        assert_eq!(result.packet_loss_pct, 100.0);
    }
}
