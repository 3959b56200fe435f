use tokio::process::Child;

use crate::extractor::{self, LineEffect};
use crate::types::{RunParams, RunSnapshot, RunStats, RunStatus, RunSummary};

/// Prefix for lines the orchestrator writes into a run's log itself.
pub const SYSTEM_PREFIX: &str = "[system]";

/// State of one simulation run. Always accessed under its own lock.
#[derive(Debug)]
pub struct RunRecord {
    id: String,
    params: RunParams,
    status: RunStatus,
    log: Vec<String>,
    stats: RunStats,
    process: Option<Child>,
}

impl RunRecord {
    pub fn new(id: impl Into<String>, params: RunParams) -> Self {
        Self {
            id: id.into(),
            params,
            status: RunStatus::Running,
            log: Vec::new(),
            stats: RunStats::default(),
            process: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> RunParams {
        self.params
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    /// Records one line of simulation output and applies its telemetry.
    pub fn push_output(&mut self, line: String) -> LineEffect {
        let effect = extractor::apply_line(&mut self.stats, &line, self.params.sim_time);
        self.log.push(line);
        if effect.completed {
            self.transition(RunStatus::Finished);
        }
        effect
    }

    pub fn push_system(&mut self, message: impl std::fmt::Display) {
        self.log.push(format!("{SYSTEM_PREFIX} {message}"));
    }

    pub fn push_diagnostic(&mut self, message: impl std::fmt::Display) {
        self.log.push(format!("[backend error] {message}"));
    }

    /// Moves a running record to `to`. Terminal states are final, so this is
    /// a no-op (returning false) once the run has left `Running`.
    pub fn transition(&mut self, to: RunStatus) -> bool {
        if self.status.is_terminal() || to == RunStatus::Running {
            return false;
        }
        self.status = to;
        true
    }

    pub fn attach_process(&mut self, child: Child) {
        self.process = Some(child);
    }

    pub fn process_mut(&mut self) -> Option<&mut Child> {
        self.process.as_mut()
    }

    /// Releases the process handle. Only the first call yields it.
    pub fn release_process(&mut self) -> Option<Child> {
        self.process.take()
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn snapshot(&self, tail: usize) -> RunSnapshot {
        let start = self.log.len().saturating_sub(tail);
        RunSnapshot {
            run_id: self.id.clone(),
            status: self.status,
            params: self.params,
            log: self.log[start..].to_vec(),
            stats: self.stats.clone(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.id.clone(),
            status: self.status,
            params: self.params,
        }
    }
}
