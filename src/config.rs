use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_PROGRAM: &str = "TRAFFIC_SIM_PROGRAM";
pub const ENV_ARGS: &str = "TRAFFIC_SIM_ARGS";
pub const ENV_WORKDIR: &str = "TRAFFIC_SIM_WORKDIR";
pub const ENV_STOP_TIMEOUT_MS: &str = "TRAFFIC_SIM_STOP_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{name}={value:?} is not a valid value")]
    InvalidEnv { name: &'static str, value: String },
}

/// How simulation runs are launched and supervised.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Grace period between SIGTERM and kill when a run is stopped.
    pub stop_timeout_ms: u64,
    /// Number of trailing log lines returned by status queries.
    pub log_tail_lines: usize,
    pub exit_poll_interval_ms: u64,
    /// Passed to every simulation process on top of the derived variables.
    pub extra_env: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            program: "python3".into(),
            args: vec!["simulation.py".into()],
            working_dir: None,
            stop_timeout_ms: 3_000,
            log_tail_lines: 300,
            exit_poll_interval_ms: 50,
            extra_env: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlays `TRAFFIC_SIM_*` variables read through `lookup`.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(program) = lookup(ENV_PROGRAM).filter(|p| !p.trim().is_empty()) {
            self.program = program;
        }
        if let Some(args) = lookup(ENV_ARGS) {
            self.args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(dir) = lookup(ENV_WORKDIR).filter(|d| !d.trim().is_empty()) {
            self.working_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup(ENV_STOP_TIMEOUT_MS) {
            self.stop_timeout_ms =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv {
                        name: ENV_STOP_TIMEOUT_MS,
                        value,
                    })?;
        }
        Ok(self)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms.max(1))
    }
}
