//! Run registry: owns every simulation run started by this process.
//!
//! Each run gets its own record lock and its own Tokio worker task. The
//! registry lock only guards membership and workers never take it.

use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::Instrument;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{ExitDescription, RunError};
use crate::events::{NoopObserver, RunObserver};
use crate::launcher::{self, LaunchedProcess, OutputLines, ProcessLauncher, Termination};
use crate::record::RunRecord;
use crate::types::{CreatedRun, RunParams, RunSnapshot, RunStatus, RunSummary, StopReceipt};

type SharedRecord = Arc<Mutex<RunRecord>>;

#[derive(Default)]
struct Runs {
    by_id: HashMap<String, SharedRecord>,
    order: Vec<SharedRecord>,
}

pub struct RunRegistry {
    config: OrchestratorConfig,
    launcher: ProcessLauncher,
    observer: Arc<dyn RunObserver>,
    runs: Mutex<Runs>,
}

/// Locks `mutex`, recovering the guard if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RunRegistry {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_observer(config, Arc::new(NoopObserver))
    }

    pub fn with_observer(config: OrchestratorConfig, observer: Arc<dyn RunObserver>) -> Self {
        Self {
            launcher: ProcessLauncher::new(&config),
            config,
            observer,
            runs: Mutex::new(Runs::default()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registers a new run and starts its worker. Returns as soon as the
    /// worker is spawned; launch failures show up in the run's status.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create_run(&self, params: RunParams) -> Result<CreatedRun, RunError> {
        params.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let record = Arc::new(Mutex::new(RunRecord::new(run_id.clone(), params)));
        {
            let mut runs = lock(&self.runs);
            runs.by_id.insert(run_id.clone(), Arc::clone(&record));
            runs.order.push(Arc::clone(&record));
        }

        tracing::info!(
            run_id = %run_id,
            sim_time = params.sim_time,
            min_green = params.min_green,
            max_green = params.max_green,
            "starting simulation run"
        );

        let worker = Worker {
            run_id: run_id.clone(),
            params,
            record,
            launcher: self.launcher.clone(),
            observer: Arc::clone(&self.observer),
            poll_interval: self.config.exit_poll_interval(),
            stop_timeout: self.config.stop_timeout(),
        };
        let span = tracing::info_span!("run", run_id = %run_id);
        worker.spawn(span);

        Ok(CreatedRun { run_id })
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunSnapshot, RunError> {
        let record = self.lookup(run_id)?;
        let record = lock(&record);
        Ok(record.snapshot(self.config.log_tail_lines))
    }

    pub fn list_runs(&self) -> Vec<RunSummary> {
        let runs = lock(&self.runs);
        runs.order.iter().map(|r| lock(r).summary()).collect()
    }

    /// Stops a run. Stopping a run that already ended leaves its status and
    /// log untouched and still reports `stopped`. A process still attached
    /// to such a run (one that printed its completion marker and kept
    /// running) is terminated all the same.
    pub async fn stop_run(&self, run_id: &str) -> Result<StopReceipt, RunError> {
        let record = self.lookup(run_id)?;
        let receipt = StopReceipt {
            run_id: run_id.to_string(),
            status: RunStatus::Stopped,
        };

        let (stopped, child) = {
            let mut record = lock(&record);
            let stopped = record.transition(RunStatus::Stopped);
            if stopped {
                record.push_system("stop requested by user");
            }
            (stopped, record.release_process())
        };
        if stopped {
            tracing::info!(run_id, "simulation run stopped");
            self.observer.on_status(run_id, RunStatus::Stopped);
        }

        let Some(mut child) = child else {
            return Ok(receipt);
        };
        if !stopped {
            tracing::info!(run_id, "terminating simulation that outlived its run");
        }
        let grace = self.config.stop_timeout();
        match launcher::terminate(&mut child, grace).await {
            Ok(Termination::Killed) => {
                tracing::warn!(run_id, ?grace, "simulation ignored SIGTERM; killed");
                if stopped {
                    lock(&record).push_system(format!(
                        "simulation did not exit within {} ms; killed",
                        grace.as_millis()
                    ));
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(run_id, error = %err, "failed to stop simulation process");
                if stopped {
                    lock(&record).push_diagnostic(format!("failed to stop simulation: {err}"));
                }
            }
        }
        Ok(receipt)
    }

    fn lookup(&self, run_id: &str) -> Result<SharedRecord, RunError> {
        lock(&self.runs)
            .by_id
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }
}

impl Drop for RunRegistry {
    fn drop(&mut self) {
        let runs = lock(&self.runs);
        for record in &runs.order {
            if let Some(child) = lock(record).process_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

struct Worker {
    run_id: String,
    params: RunParams,
    record: SharedRecord,
    launcher: ProcessLauncher,
    observer: Arc<dyn RunObserver>,
    poll_interval: Duration,
    stop_timeout: Duration,
}

enum Exit {
    /// The handle was released by a stop request before the exit was seen.
    Released,
    Status(ExitStatus),
    Failed(std::io::Error),
}

impl Worker {
    /// Runs the worker on its own task. A panic inside it still resolves
    /// the run to `error` instead of leaving it `running`.
    fn spawn(self, span: tracing::Span) {
        let run_id = self.run_id.clone();
        let record = Arc::clone(&self.record);
        let observer = Arc::clone(&self.observer);
        let task = tokio::spawn(self.run().instrument(span));

        tokio::spawn(async move {
            let Err(err) = task.await else {
                return;
            };
            tracing::error!(run_id = %run_id, error = %err, "run worker crashed");
            let (changed, child) = {
                let mut record = lock(&record);
                record.push_diagnostic(format!("worker crashed: {err}"));
                (record.transition(RunStatus::Error), record.release_process())
            };
            if let Some(mut child) = child {
                let _ = child.start_kill();
            }
            if changed {
                observer.on_status(&run_id, RunStatus::Error);
            }
        });
    }

    async fn run(self) {
        let LaunchedProcess { child, output } = match self.launcher.launch(&self.params) {
            Ok(process) => process,
            Err(err) => {
                tracing::warn!(error = %err, "simulation failed to start");
                let changed = {
                    let mut record = lock(&self.record);
                    record.push_diagnostic(&err);
                    record.transition(RunStatus::Error)
                };
                self.notify(changed.then_some(RunStatus::Error));
                return;
            }
        };

        // A stop can land between registration and launch.
        let orphan = {
            let mut record = lock(&self.record);
            if record.status().is_terminal() {
                Some(child)
            } else {
                record.attach_process(child);
                None
            }
        };
        if let Some(mut child) = orphan {
            let _ = launcher::terminate(&mut child, self.stop_timeout).await;
            lock(&self.record).push_system("simulation halted by user");
            return;
        }

        if !self.pump(output).await {
            return;
        }
        let exit = self.reap().await;
        self.finish(exit);
    }

    /// Copies output into the record until both streams close. Returns false
    /// if reading failed and the run was resolved to `error`.
    async fn pump(&self, mut output: OutputLines) -> bool {
        loop {
            match output.next_line().await {
                Ok(Some(line)) => {
                    let changed = {
                        let mut record = lock(&self.record);
                        let before = record.status();
                        record.push_output(line.clone());
                        let after = record.status();
                        (before != after).then_some(after)
                    };
                    self.observer.on_line(&self.run_id, &line);
                    self.notify(changed);
                }
                Ok(None) => return true,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read simulation output");
                    let (changed, child) = {
                        let mut record = lock(&self.record);
                        record.push_diagnostic(format!("failed to read simulation output: {err}"));
                        (record.transition(RunStatus::Error), record.release_process())
                    };
                    if let Some(mut child) = child {
                        let _ = launcher::terminate(&mut child, self.stop_timeout).await;
                    }
                    self.notify(changed.then_some(RunStatus::Error));
                    return false;
                }
            }
        }
    }

    /// Waits for the process to exit without holding the record lock between
    /// polls, so a stop request can still take the handle.
    async fn reap(&self) -> Exit {
        loop {
            {
                let mut record = lock(&self.record);
                let polled = match record.process_mut() {
                    None => return Exit::Released,
                    Some(child) => child.try_wait(),
                };
                match polled {
                    Ok(Some(status)) => {
                        record.release_process();
                        return Exit::Status(status);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        record.release_process();
                        return Exit::Failed(err);
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn finish(&self, exit: Exit) {
        let changed = {
            let mut record = lock(&self.record);
            let changed = match exit {
                Exit::Released => false,
                Exit::Status(status) if status.success() => {
                    record.transition(RunStatus::Finished)
                }
                Exit::Status(status) => {
                    let description = match status.code() {
                        Some(code) => ExitDescription::Code(code),
                        None => ExitDescription::Signal,
                    };
                    if record.status() != RunStatus::Stopped {
                        record.push_system(RunError::Process(description));
                    }
                    record.transition(RunStatus::Error)
                }
                Exit::Failed(err) => {
                    record.push_diagnostic(format!("failed to wait for simulation: {err}"));
                    record.transition(RunStatus::Error)
                }
            };
            if record.status() == RunStatus::Stopped {
                record.push_system("simulation halted by user");
            }
            changed.then(|| record.status())
        };

        match changed {
            Some(status) => tracing::info!(%status, "simulation run ended"),
            None => tracing::debug!("simulation process exited"),
        }
        self.notify(changed);
    }

    fn notify(&self, status: Option<RunStatus>) {
        if let Some(status) = status {
            self.observer.on_status(&self.run_id, status);
        }
    }
}
