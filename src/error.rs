//! Error types for supervising the backend process.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Which launch precondition was not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPath {
    Script,
    WorkingDirectory,
}

impl std::fmt::Display for MissingPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MissingPath::Script => f.write_str("Server script"),
            MissingPath::WorkingDirectory => f.write_str("Working directory"),
        }
    }
}

/// Failures that end a `start()` attempt.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Script or working directory absent; nothing was spawned
    #[error("{kind} not found at {}", .path.display())]
    PathMissing { kind: MissingPath, path: PathBuf },

    /// The OS refused to create the process
    #[error("Failed to start process `{interpreter}`: {source}")]
    Spawn {
        interpreter: String,
        #[source]
        source: io::Error,
    },

    /// Process is alive but never answered healthy
    #[error("Server did not become healthy within {}ms", .budget.as_millis())]
    ReadinessTimeout { budget: Duration },

    /// Process exited before it became healthy
    #[error("Server process exited before becoming healthy (exit code {})", display_code(.code))]
    ProcessCrashed { code: Option<i32> },

    /// `stop()` cleared the handle while the start was waiting for readiness
    #[error("Server start cancelled by stop()")]
    Cancelled,
}

/// Fieldless discriminant of [`SupervisorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PathMissing,
    Spawn,
    ReadinessTimeout,
    ProcessCrashed,
    Cancelled,
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::PathMissing { .. } => ErrorKind::PathMissing,
            SupervisorError::Spawn { .. } => ErrorKind::Spawn,
            SupervisorError::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            SupervisorError::ProcessCrashed { .. } => ErrorKind::ProcessCrashed,
            SupervisorError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Short text for the person running the host application.
    ///
    /// A crash points at the captured log; a timeout means the server may
    /// still come up.
    pub fn user_message(&self) -> String {
        match self {
            SupervisorError::PathMissing { .. } => format!("Critical error: {}", self),
            SupervisorError::Spawn { .. } => format!(
                "{}. If the interpreter is not found, make sure it is installed and on PATH.",
                self
            ),
            SupervisorError::ReadinessTimeout { .. } => {
                "Server start timed out. It is still running; see the server log.".to_string()
            }
            SupervisorError::ProcessCrashed { .. } => format!(
                "Server failed to start: the process exited (code {}). Check the server log for errors such as ImportError or SyntaxError.",
                display_code(&self.exit_code())
            ),
            SupervisorError::Cancelled => "Server start was cancelled.".to_string(),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        match self {
            SupervisorError::ProcessCrashed { code } => *code,
            _ => None,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Why a single health probe did not come back healthy.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("reported status `{0}`")]
    NotHealthy(String),

    #[error("probe exceeded its deadline")]
    Deadline,
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
