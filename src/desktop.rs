//! Relays run output and status changes to the desktop window as events.

use serde::Serialize;
use tauri::{AppHandle, Emitter};

use crate::events::{RunObserver, EVENT_RUN_LINE, EVENT_RUN_STATUS};
use crate::types::RunStatus;

#[derive(Clone, Serialize)]
struct LinePayload<'a> {
    run_id: &'a str,
    line: &'a str,
}

#[derive(Clone, Serialize)]
struct StatusPayload<'a> {
    run_id: &'a str,
    status: RunStatus,
}

pub struct WindowObserver {
    app: AppHandle,
}

impl WindowObserver {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl RunObserver for WindowObserver {
    fn on_line(&self, run_id: &str, line: &str) {
        let _ = self.app.emit(EVENT_RUN_LINE, LinePayload { run_id, line });
    }

    fn on_status(&self, run_id: &str, status: RunStatus) {
        let _ = self.app.emit(EVENT_RUN_STATUS, StatusPayload { run_id, status });
    }
}
