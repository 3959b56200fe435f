//! Simulation launcher: starts the simulation executable as a child process.
//!
//! Parameters travel as environment variables. stdout and stderr are both
//! piped and read back as a single sequence of lines.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::OrchestratorConfig;
use crate::error::RunError;
use crate::types::RunParams;

pub const ENV_SIM_TIME: &str = "SIM_TIME";
pub const ENV_MIN_GREEN: &str = "MIN_GREEN_TIME";
pub const ENV_MAX_GREEN: &str = "MAX_GREEN_TIME";

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    extra_env: BTreeMap<String, String>,
}

pub struct LaunchedProcess {
    pub child: Child,
    pub output: OutputLines,
}

impl ProcessLauncher {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            extra_env: config.extra_env.clone(),
        }
    }

    pub fn launch(&self, params: &RunParams) -> Result<LaunchedProcess, RunError> {
        let extra_env = &self.extra_env;
        let env = derived_env(params, |name| {
            extra_env
                .get(name)
                .cloned()
                .or_else(|| std::env::var(name).ok())
        });

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.extra_env)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(RunError::Launch)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Launch(io::Error::other("no stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunError::Launch(io::Error::other("no stderr")))?;

        Ok(LaunchedProcess {
            child,
            output: OutputLines {
                stdout: Some(BufReader::new(stdout).lines()),
                stderr: Some(BufReader::new(stderr).lines()),
            },
        })
    }
}

/// Environment for one run: the three parameters, plus headless rendering
/// hints unless `lookup` (the inherited environment) already sets them.
pub fn derived_env(
    params: &RunParams,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<(&'static str, String)> {
    let mut env = vec![
        (ENV_SIM_TIME, params.sim_time.to_string()),
        (ENV_MIN_GREEN, params.min_green.to_string()),
        (ENV_MAX_GREEN, params.max_green.to_string()),
    ];

    let mut hint = |name: &'static str, value: &str| {
        if lookup(name).is_none() {
            env.push((name, value.to_string()));
        }
    };
    hint("PYGAME_HIDE_SUPPORT_PROMPT", "1");
    hint("PYTHONUNBUFFERED", "1");
    let has_display = lookup("DISPLAY").is_some_and(|d| !d.is_empty());
    if !has_display && !cfg!(windows) {
        hint("SDL_VIDEODRIVER", "dummy");
        hint("SDL_AUDIODRIVER", "dummy");
    }
    env
}

/// stdout and stderr of a child, interleaved line by line as they arrive.
pub struct OutputLines {
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl OutputLines {
    /// Next line from either stream; `None` once both are closed.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let (stream, line) = match (&mut self.stdout, &mut self.stderr) {
                (None, None) => return Ok(None),
                (Some(out), None) => (Stream::Stdout, out.next_line().await),
                (None, Some(err)) => (Stream::Stderr, err.next_line().await),
                (Some(out), Some(err)) => tokio::select! {
                    line = out.next_line() => (Stream::Stdout, line),
                    line = err.next_line() => (Stream::Stderr, line),
                },
            };

            match line? {
                Some(line) => return Ok(Some(line)),
                None => match stream {
                    Stream::Stdout => self.stdout = None,
                    Stream::Stderr => self.stderr = None,
                },
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before it was signalled.
    AlreadyExited(ExitStatus),
    /// Exited within the grace period after SIGTERM.
    Exited(ExitStatus),
    /// Did not exit in time and was killed.
    Killed,
}

/// Asks `child` to exit, then kills it if it is still alive after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) -> io::Result<Termination> {
    if let Some(status) = child.try_wait()? {
        return Ok(Termination::AlreadyExited(status));
    }

    if let Err(err) = request_exit(child) {
        tracing::warn!(error = %err, "failed to signal simulation process");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(Termination::Exited(status?)),
        Err(_) => {
            child.kill().await?;
            Ok(Termination::Killed)
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid).map_err(io::Error::other)?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
