use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::RunError;

/// Lane identifiers tracked by the simulation. Four directions, fixed.
pub const LANE_IDS: [u8; 4] = [1, 2, 3, 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub sim_time: u32,
    pub min_green: u32,
    pub max_green: u32,
}

impl RunParams {
    pub fn validate(&self) -> Result<(), RunError> {
        if self.sim_time == 0 {
            return Err(RunError::InvalidParams("sim_time must be positive".into()));
        }
        if self.min_green == 0 {
            return Err(RunError::InvalidParams("min_green must be positive".into()));
        }
        if self.max_green < self.min_green {
            return Err(RunError::InvalidParams(format!(
                "max_green ({}) must be at least min_green ({})",
                self.max_green, self.min_green
            )));
        }
        Ok(())
    }
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            sim_time: 120,
            min_green: 10,
            max_green: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Finished,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Error => "error",
            RunStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub total: u64,
    pub car: u64,
    pub bus: u64,
    pub truck: u64,
    pub rickshaw: u64,
    pub bike: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub phase: String,
    pub lanes: BTreeMap<u8, LaneStats>,
    pub total_vehicles: u64,
    pub total_time: u64,
    pub throughput: f64,
    pub traffic_density: f64,
    pub congestion_level: f64,
    pub average_wait: f64,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            phase: String::new(),
            lanes: LANE_IDS
                .iter()
                .map(|&lane| (lane, LaneStats::default()))
                .collect(),
            total_vehicles: 0,
            total_time: 0,
            throughput: 0.0,
            traffic_density: 0.0,
            congestion_level: 0.0,
            average_wait: 0.0,
        }
    }
}

/// Point-in-time copy of a run, as returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub params: RunParams,
    pub log: Vec<String>,
    pub stats: RunStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub params: RunParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedRun {
    pub run_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReceipt {
    pub run_id: String,
    pub status: RunStatus,
}
