//! Summary metrics derived from the raw counters of a run.
//!
//! Recomputed after any update to `total_time`, `total_vehicles` or
//! `throughput`. Capacity assumes the four fixed lanes.

use crate::types::{RunStats, LANE_IDS};

pub fn recompute(stats: &mut RunStats, sim_time: u32) {
    stats.average_wait = if stats.total_vehicles > 0 {
        round_to(stats.total_time as f64 / stats.total_vehicles as f64, 2)
    } else {
        0.0
    };

    let capacity = (u64::from(sim_time) * LANE_IDS.len() as u64).max(1);
    let density_ratio = (stats.total_vehicles as f64 / capacity as f64).min(1.0);
    stats.traffic_density = round_to(density_ratio * 100.0, 1);
    // Kept identical to traffic_density; clients read both fields.
    stats.congestion_level = stats.traffic_density;
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round_ties_even() / factor
}
