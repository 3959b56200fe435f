//! Line protocol spoken by the simulation executable.
//!
//! `PROTOCOL` is the whole protocol: an ordered table of line shapes and
//! the update each one applies to a run's stats. Lines that match no row
//! are kept in the log only. A line may match several rows; every matching
//! row applies, in table order. Malformed numeric content leaves the prior
//! values in place.

use std::collections::HashMap;

use crate::metrics;
use crate::types::{LaneStats, RunStats, LANE_IDS};

/// What applying one output line did to a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LineEffect {
    pub stats_changed: bool,
    /// The simulation announced it is done (`SIMULATION_COMPLETE`).
    pub completed: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum Pattern {
    ContainsAny(&'static [&'static str]),
    Prefix(&'static str),
    PrefixContaining(&'static str, &'static str),
}

impl Pattern {
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Pattern::ContainsAny(needles) => needles.iter().any(|n| line.contains(n)),
            Pattern::Prefix(prefix) => line.starts_with(prefix),
            Pattern::PrefixContaining(prefix, needle) => {
                line.starts_with(prefix) && line.contains(needle)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Update {
    Phase,
    Lane,
    /// Raw counters moved; summary metrics must be recomputed.
    Counters,
    Complete,
    Ignored,
}

pub struct Rule {
    pub name: &'static str,
    pub pattern: Pattern,
    apply: fn(&mut RunStats, &str) -> Update,
}

pub const PROTOCOL: &[Rule] = &[
    Rule {
        name: "signal_phase",
        pattern: Pattern::ContainsAny(&["GREEN TS", "YELLOW TS", "RED TS"]),
        apply: apply_phase,
    },
    Rule {
        name: "lane_stats",
        pattern: Pattern::Prefix("LANE_STATS"),
        apply: apply_lane_stats,
    },
    Rule {
        name: "lane_total",
        pattern: Pattern::PrefixContaining("Lane ", "Total:"),
        apply: apply_lane_total,
    },
    Rule {
        name: "total_vehicles",
        pattern: Pattern::Prefix("Total vehicles passed"),
        apply: apply_total_vehicles,
    },
    Rule {
        name: "total_time",
        pattern: Pattern::Prefix("Total time passed"),
        apply: apply_total_time,
    },
    Rule {
        name: "throughput",
        pattern: Pattern::Prefix("No. of vehicles passed per unit time"),
        apply: apply_throughput,
    },
    Rule {
        name: "summary",
        pattern: Pattern::Prefix("SUMMARY"),
        apply: apply_summary,
    },
    Rule {
        name: "complete",
        pattern: Pattern::Prefix("SIMULATION_COMPLETE"),
        apply: apply_complete,
    },
];

/// Applies one output line to `stats`, recomputing the summary metrics
/// when any raw counter changed.
pub fn apply_line(stats: &mut RunStats, line: &str, sim_time: u32) -> LineEffect {
    let line = line.trim();
    let mut effect = LineEffect::default();
    if line.is_empty() {
        return effect;
    }

    let mut recompute = false;
    for rule in PROTOCOL.iter().filter(|rule| rule.pattern.matches(line)) {
        match (rule.apply)(stats, line) {
            Update::Phase | Update::Lane => effect.stats_changed = true,
            Update::Counters => {
                effect.stats_changed = true;
                recompute = true;
            }
            Update::Complete => effect.completed = true,
            Update::Ignored => {
                tracing::debug!(rule = rule.name, line, "ignoring malformed telemetry line");
            }
        }
    }

    if recompute {
        metrics::recompute(stats, sim_time);
    }
    effect
}

fn apply_phase(stats: &mut RunStats, line: &str) -> Update {
    stats.phase = line.to_string();
    Update::Phase
}

fn apply_lane_stats(stats: &mut RunStats, line: &str) -> Update {
    let Some(fields) = key_values(line) else {
        return Update::Ignored;
    };
    let Some(lane) = fields.get("lane").and_then(|v| parse_lane(v)) else {
        return Update::Ignored;
    };

    let count = |key: &str| match fields.get(key) {
        Some(value) => value.parse::<u64>().ok(),
        None => Some(0),
    };
    let detail = (|| {
        Some(LaneStats {
            total: count("total")?,
            car: count("car")?,
            bus: count("bus")?,
            truck: count("truck")?,
            rickshaw: count("rickshaw")?,
            bike: count("bike")?,
        })
    })();

    match detail {
        Some(detail) => {
            stats.lanes.insert(lane, detail);
            Update::Lane
        }
        None => Update::Ignored,
    }
}

// `Lane 1: Total: 38`, or with extra colon-separated fields before `Total:`.
fn apply_lane_total(stats: &mut RunStats, line: &str) -> Update {
    let lane = line
        .split(':')
        .next()
        .and_then(|head| head.split_whitespace().nth(1))
        .and_then(parse_lane);
    let total = line
        .rsplit_once("Total:")
        .and_then(|(_, value)| value.trim().parse::<u64>().ok());

    match (lane, total) {
        (Some(lane), Some(total)) => {
            stats.lanes.entry(lane).or_default().total = total;
            Update::Lane
        }
        _ => Update::Ignored,
    }
}

fn apply_total_vehicles(stats: &mut RunStats, line: &str) -> Update {
    match colon_value(line).and_then(parse_count) {
        Some(value) => {
            stats.total_vehicles = value;
            Update::Counters
        }
        None => Update::Ignored,
    }
}

fn apply_total_time(stats: &mut RunStats, line: &str) -> Update {
    match colon_value(line).and_then(parse_count) {
        Some(value) => {
            stats.total_time = value;
            Update::Counters
        }
        None => Update::Ignored,
    }
}

fn apply_throughput(stats: &mut RunStats, line: &str) -> Update {
    match colon_value(line).and_then(parse_rate) {
        Some(value) => {
            stats.throughput = value;
            Update::Counters
        }
        None => Update::Ignored,
    }
}

fn apply_summary(stats: &mut RunStats, line: &str) -> Update {
    let Some(fields) = key_values(line) else {
        return Update::Ignored;
    };

    let total = fields.get("total").map(|v| parse_count(v));
    let time = fields.get("time").map(|v| parse_count(v));
    let throughput = fields.get("throughput").map(|v| parse_rate(v));
    if total == Some(None) || time == Some(None) || throughput == Some(None) {
        return Update::Ignored;
    }

    if let Some(Some(total)) = total {
        stats.total_vehicles = total;
    }
    if let Some(Some(time)) = time {
        stats.total_time = time;
    }
    if let Some(Some(throughput)) = throughput {
        stats.throughput = throughput;
    }
    Update::Counters
}

fn apply_complete(_: &mut RunStats, _: &str) -> Update {
    Update::Complete
}

/// Splits `KEYWORD k=v k=v ...` into its fields. Any token without exactly
/// one `=` makes the whole line malformed.
fn key_values(line: &str) -> Option<HashMap<&str, &str>> {
    line.split_whitespace()
        .skip(1)
        .map(|token| {
            let (key, value) = token.split_once('=')?;
            if value.contains('=') {
                return None;
            }
            Some((key, value))
        })
        .collect()
}

fn colon_value(line: &str) -> Option<&str> {
    line.split(':').nth(1).map(str::trim)
}

fn parse_lane(value: &str) -> Option<u8> {
    value.parse::<u8>().ok().filter(|lane| LANE_IDS.contains(lane))
}

/// Counts arrive as integers or floats (`40`, `40.0`); floats truncate.
fn parse_count(value: &str) -> Option<u64> {
    let value = value.parse::<f64>().ok()?;
    (value.is_finite() && value >= 0.0).then(|| value.trunc() as u64)
}

fn parse_rate(value: &str) -> Option<f64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|rate| rate.is_finite() && *rate >= 0.0)
}
