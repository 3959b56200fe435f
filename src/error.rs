use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid run parameters: {0}")]
    InvalidParams(String),
    #[error("run not found: {0}")]
    NotFound(String),
    #[error("failed to launch simulation: {0}")]
    Launch(#[source] std::io::Error),
    #[error("simulation {0}")]
    Process(ExitDescription),
}

/// How a simulation process ended when it did not exit cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDescription {
    Code(i32),
    Signal,
}

impl std::fmt::Display for ExitDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitDescription::Code(code) => write!(f, "exited with code {code}"),
            ExitDescription::Signal => f.write_str("terminated by signal"),
        }
    }
}
