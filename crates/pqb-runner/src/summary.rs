//! Per-topology aggregation of campaign results

use serde::Serialize;
use std::collections::HashMap;

use pqb_core::types::TopologyId;

use crate::record::RunRecord;

/// Aggregated outcome of every iteration of one topology
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologySummary {
    pub topology: u32,
    pub runs: u32,
    pub successes: u32,
    pub failed: u32,
    pub skipped: u32,
    pub aborted: u32,
    pub success_rate_percent: f64,
    /// Mean/median/p95 over successful iterations; zero when none succeeded
    pub mean_duration_s: f64,
    pub median_duration_s: f64,
    pub p95_duration_s: f64,
}

/// Group records per topology, preserving first-appearance (schedule) order
pub fn summarize(records: &[RunRecord]) -> Vec<TopologySummary> {
    let mut order: Vec<TopologyId> = Vec::new();
    let mut groups: HashMap<TopologyId, Vec<&RunRecord>> = HashMap::new();

    for record in records {
        if !groups.contains_key(&record.topology) {
            order.push(record.topology);
        }
        groups.entry(record.topology).or_default().push(record);
    }

    order
        .into_iter()
        .map(|topology| {
            let group = &groups[&topology];
            let runs = group.len() as u32;
            let successes = group.iter().filter(|r| r.status.is_success()).count() as u32;
            let failed = group.iter().filter(|r| r.status.is_failed()).count() as u32;
            let skipped = group.iter().filter(|r| r.status.is_skipped()).count() as u32;
            let aborted = group.iter().filter(|r| r.status.is_aborted()).count() as u32;

            let mut durations: Vec<f64> = group
                .iter()
                .filter(|r| r.status.is_success())
                .map(|r| r.duration_secs())
                .collect();
            durations.sort_by(|a, b| a.total_cmp(b));

            let mean = if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<f64>() / durations.len() as f64
            };

            TopologySummary {
                topology: topology.as_u32(),
                runs,
                successes,
                failed,
                skipped,
                aborted,
                success_rate_percent: if runs == 0 {
                    0.0
                } else {
                    successes as f64 * 100.0 / runs as f64
                },
                mean_duration_s: mean,
                median_duration_s: percentile(&durations, 50.0),
                p95_duration_s: percentile(&durations, 95.0),
            }
        })
        .collect()
}

/// Nearest-rank percentile over an ascending-sorted slice
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
