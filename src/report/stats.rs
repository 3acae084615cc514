//! Aggregate statistics over a slice of probe results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::db::{ProbeResult, MAIN_CONNECTION};

/// Summary of one connection's results over a window. All values are
/// rounded to two decimals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub total_tests: u64,
    pub successful_tests: u64,
    pub success_rate_pct: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub avg_latency_ms: f64,
    pub avg_jitter_ms: f64,
    pub avg_packet_loss_pct: f64,
}

impl AggregateStats {
    /// Compute stats from one partition. Latency and jitter only consider
    /// successful results carrying that value; packet loss considers all.
    pub fn from_results<'a, I>(results: I) -> Self
    where
        I: IntoIterator<Item = &'a ProbeResult>,
    {
        let mut total = 0u64;
        let mut successful = 0u64;
        let mut loss_sum = 0.0;
        let mut latencies = Vec::new();
        let mut jitters = Vec::new();

        for r in results {
            total += 1;
            loss_sum += r.packet_loss_pct;
            if !r.successful {
                continue;
            }
            successful += 1;
            if let Some(latency) = r.latency_ms {
                latencies.push(latency);
            }
            if let Some(jitter) = r.jitter_ms {
                jitters.push(jitter);
            }
        }

        if total == 0 {
            return Self::default();
        }

        let min = latencies.iter().copied().fold(f64::INFINITY, f64::min);
        let max = latencies.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Self {
            total_tests: total,
            successful_tests: successful,
            success_rate_pct: round2(successful as f64 / total as f64 * 100.0),
            min_latency_ms: if latencies.is_empty() { 0.0 } else { round2(min) },
            max_latency_ms: if latencies.is_empty() { 0.0 } else { round2(max) },
            avg_latency_ms: round2(mean(&latencies)),
            avg_jitter_ms: round2(mean(&jitters)),
            avg_packet_loss_pct: round2(loss_sum / total as f64),
        }
    }
}

/// Partition results by connection key (`"main"` for the primary address)
/// and aggregate each. Every key in `known` appears even without results.
pub fn stats_by_connection<'a, I, K>(results: I, known: K) -> BTreeMap<String, AggregateStats>
where
    I: IntoIterator<Item = &'a ProbeResult>,
    K: IntoIterator<Item = String>,
{
    let mut partitions: BTreeMap<String, Vec<&ProbeResult>> = BTreeMap::new();
    partitions.entry(MAIN_CONNECTION.to_string()).or_default();
    for key in known {
        partitions.entry(key).or_default();
    }
    for r in results {
        partitions.entry(r.connection_key().to_string()).or_default().push(r);
    }

    partitions
        .into_iter()
        .map(|(key, rows)| (key, AggregateStats::from_results(rows)))
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
