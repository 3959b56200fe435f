//! Run event names and the observer hook the registry reports through.
//!
//! The desktop shell relays these as window events; headless callers
//! usually keep the no-op observer.

use crate::types::RunStatus;

pub const EVENT_RUN_LINE: &str = "simulation://line";
pub const EVENT_RUN_STATUS: &str = "simulation://status";

/// Receives live output and status changes. Called outside any run lock,
/// after the corresponding state is visible to queries.
pub trait RunObserver: Send + Sync {
    fn on_line(&self, _run_id: &str, _line: &str) {}

    fn on_status(&self, _run_id: &str, _status: RunStatus) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
