//! City traffic dataset collaborator.
//!
//! Records are keyed by a normalized city name. Fetching fresh data from
//! remote feeds happens elsewhere; this module only loads and merges.
//! It is a public API for dashboard front ends; the run orchestrator itself
//! never reads city data.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("read dataset {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse dataset {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityRecord {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default = "unknown_classification")]
    pub classification: String,
    #[serde(default)]
    pub population_millions: f64,
    #[serde(default)]
    pub avg_peak_speed_kmph: f64,
    #[serde(default)]
    pub avg_delay_minutes: f64,
    #[serde(default)]
    pub vehicle_mix: HashMap<String, f64>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

fn unknown_classification() -> String {
    "unknown".into()
}

impl CityRecord {
    pub fn key(&self) -> String {
        normalize_key(&self.city)
    }
}

/// `"  New   Delhi "` -> `"new-delhi"`.
pub fn normalize_key(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

pub trait CityDataset {
    fn load_records(&self) -> Result<Vec<CityRecord>, DatasetError>;
}

/// Reads the first existing file among `candidates` (latest refresh first,
/// then the bundled baseline). No file at all is an empty dataset.
#[derive(Debug, Clone)]
pub struct JsonFileDataset {
    candidates: Vec<PathBuf>,
}

impl JsonFileDataset {
    pub fn new(candidates: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            candidates: candidates.into_iter().collect(),
        }
    }

    /// `traffic_latest.json`, then `traffic_sample.json`, under `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self::new([
            dir.join("traffic_latest.json"),
            dir.join("traffic_sample.json"),
        ])
    }
}

impl CityDataset for JsonFileDataset {
    fn load_records(&self) -> Result<Vec<CityRecord>, DatasetError> {
        let Some(path) = self.candidates.iter().find(|p| p.exists()) else {
            return Ok(Vec::new());
        };
        let data = std::fs::read_to_string(path).map_err(|source| DatasetError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| DatasetError::Parse {
            path: path.clone(),
            source,
        })
    }
}

/// Supplements replace primary records with the same key in place; new
/// keys are appended in the order they arrive.
pub fn merge_records(
    primary: Vec<CityRecord>,
    supplements: impl IntoIterator<Item = CityRecord>,
) -> Vec<CityRecord> {
    let mut merged: Vec<CityRecord> = Vec::with_capacity(primary.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for record in primary.into_iter().chain(supplements) {
        let key = record.key();
        if let Some(&index) = positions.get(&key) {
            merged[index] = record;
        } else {
            positions.insert(key, merged.len());
            merged.push(record);
        }
    }
    merged
}
