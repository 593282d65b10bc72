//! Python interpreter discovery.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::DEFAULT_INTERPRETER;

/// Tried in this order after the configured interpreter.
pub const FALLBACK_INTERPRETERS: &[&str] = &["py", "python", "python3"];

#[derive(Debug)]
enum CheckFailure {
    Spawn(std::io::Error),
    Status(Option<i32>),
    Timeout,
}

impl std::fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckFailure::Spawn(e) => write!(f, "{}", e),
            CheckFailure::Status(Some(code)) => write!(f, "exit code {}", code),
            CheckFailure::Status(None) => f.write_str("terminated by signal"),
            CheckFailure::Timeout => f.write_str("version check timed out"),
        }
    }
}

/// Finds the first interpreter command that answers a version check.
#[derive(Debug, Clone)]
pub struct InterpreterResolver {
    candidates: Vec<String>,
    version_args: Vec<String>,
    timeout: Duration,
}

impl InterpreterResolver {
    /// Configured override first (unless it is the generic default), then the fallbacks.
    pub fn new(configured: Option<&str>, timeout: Duration) -> Self {
        let mut candidates = Vec::with_capacity(FALLBACK_INTERPRETERS.len() + 1);
        if let Some(cmd) = configured.map(str::trim).filter(|c| !c.is_empty()) {
            if cmd != DEFAULT_INTERPRETER {
                candidates.push(cmd.to_string());
            }
        }
        candidates.extend(FALLBACK_INTERPRETERS.iter().map(|c| c.to_string()));

        Self {
            candidates,
            version_args: vec!["--version".to_string()],
            timeout,
        }
    }

    /// Use an explicit candidate list instead of the Python defaults.
    pub fn with_candidates<I, S>(candidates: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            version_args: vec!["--version".to_string()],
            timeout,
        }
    }

    /// Arguments passed to each candidate during the version check.
    pub fn version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Return the first candidate whose version check exits successfully.
    ///
    /// Never fails: when every candidate is rejected the generic default is
    /// returned, even if it was among the rejected ones, and the launch reports
    /// the real problem.
    pub async fn resolve(&self) -> String {
        for candidate in &self.candidates {
            match self.check(candidate).await {
                Ok(()) => {
                    log::debug!("interpreter `{}` passed version check", candidate);
                    return candidate.clone();
                }
                Err(e) => log::debug!("interpreter `{}` rejected: {}", candidate, e),
            }
        }

        log::warn!(
            "no working interpreter among {:?}; falling back to `{}`",
            self.candidates,
            DEFAULT_INTERPRETER
        );
        DEFAULT_INTERPRETER.to_string()
    }

    async fn check(&self, candidate: &str) -> Result<(), CheckFailure> {
        let mut cmd = Command::new(candidate);
        cmd.args(&self.version_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        let mut child = cmd.spawn().map_err(CheckFailure::Spawn)?;
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(CheckFailure::Status(status.code())),
            Ok(Err(e)) => Err(CheckFailure::Spawn(e)),
            Err(_) => Err(CheckFailure::Timeout),
        }
    }
}
