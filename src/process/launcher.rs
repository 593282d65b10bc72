//! Spawning the backend and wiring its output to the log sink.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use super::{ProcessExit, SupervisedProcess};
use crate::error::{MissingPath, Result, SupervisorError};
use crate::sink::{LogSink, Stream};

/// Flag that keeps the interpreter's stdout/stderr unbuffered.
pub const UNBUFFERED_FLAG: &str = "-u";

/// Called once with the exit code when the OS reports the process gone.
pub type ExitHook = Box<dyn FnOnce(Option<i32>) + Send + 'static>;

/// How the interpreter command is turned into a spawned process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStrategy {
    /// Let the platform resolve the command through PATH
    PathLookup,
    /// Execute the given absolute path as-is
    Direct,
}

impl SpawnStrategy {
    /// Absolute `.exe` paths are executed directly; PATH lookup is known to
    /// miss them on some Windows setups.
    pub fn for_interpreter(interpreter: &str) -> Self {
        if is_native_windows_exe(interpreter) {
            SpawnStrategy::Direct
        } else {
            SpawnStrategy::PathLookup
        }
    }
}

fn is_native_windows_exe(interpreter: &str) -> bool {
    let path = Path::new(interpreter);
    let absolute = path.is_absolute() || looks_like_windows_absolute(interpreter);
    absolute
        && path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("exe"))
            .unwrap_or(false)
}

// `C:\...` is not absolute to `Path` on non-Windows hosts.
fn looks_like_windows_absolute(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Everything needed to launch one backend process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub interpreter: String,
    pub script: PathBuf,
    pub cwd: PathBuf,
    pub generation: u64,
}

impl LaunchSpec {
    fn check_paths(&self) -> Result<()> {
        check_paths(&self.script, &self.cwd)
    }

    fn command(&self) -> Command {
        let program = match SpawnStrategy::for_interpreter(&self.interpreter) {
            SpawnStrategy::Direct => PathBuf::from(&self.interpreter),
            SpawnStrategy::PathLookup => lookup(&self.interpreter),
        };

        let mut cmd = Command::new(program);
        cmd.arg(UNBUFFERED_FLAG)
            .arg(&self.script)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }

        cmd
    }
}

/// Fails with `PathMissing` when the script or its working directory is gone.
pub(crate) fn check_paths(script: &Path, cwd: &Path) -> Result<()> {
    if !script.exists() {
        return Err(SupervisorError::PathMissing {
            kind: MissingPath::Script,
            path: script.to_path_buf(),
        });
    }
    if !cwd.is_dir() {
        return Err(SupervisorError::PathMissing {
            kind: MissingPath::WorkingDirectory,
            path: cwd.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(windows)]
fn lookup(interpreter: &str) -> PathBuf {
    which::which(interpreter).unwrap_or_else(|_| PathBuf::from(interpreter))
}

#[cfg(not(windows))]
fn lookup(interpreter: &str) -> PathBuf {
    PathBuf::from(interpreter)
}

/// Spawn the backend.
///
/// Fails before spawning when the script or working directory is missing.
/// The child's stdout/stderr lines go to `sink`; `on_exit` runs once when the
/// process ends, after the returned handle already reports it as exited.
pub fn launch(spec: &LaunchSpec, sink: &LogSink, on_exit: ExitHook) -> Result<SupervisedProcess> {
    spec.check_paths().inspect_err(|e| sink.note(format!("Critical error: {}", e)))?;

    sink.note(format!("Starting server: {}", spec.script.display()));
    sink.note(format!("CWD: {}", spec.cwd.display()));
    log::debug!(
        "PATH length: {}",
        std::env::var_os("PATH").map(|p| p.len()).unwrap_or(0)
    );

    let strategy = SpawnStrategy::for_interpreter(&spec.interpreter);
    if strategy == SpawnStrategy::Direct {
        if Path::new(&spec.interpreter).exists() {
            sink.note("Interpreter file check: OK");
        } else {
            sink.note(format!("Interpreter not found at {}", spec.interpreter));
        }
    }

    let mut child = spec.command().spawn().map_err(|source| {
        sink.note(format!("[Spawn Error] Failed to start process: {}", source));
        sink.note("[Tip] If the interpreter is not found, make sure it is installed and on PATH.");
        SupervisorError::Spawn {
            interpreter: spec.interpreter.clone(),
            source,
        }
    })?;

    let pid = child.id();
    sink.note(format!(
        "Spawned `{} {} {}` (PID: {})",
        spec.interpreter,
        UNBUFFERED_FLAG,
        spec.script.display(),
        pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
    ));

    if let Some(stdout) = child.stdout.take() {
        forward(stdout, Stream::Stdout, sink.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward(stderr, Stream::Stderr, sink.clone());
    }

    let (exit_tx, exit_rx) = watch::channel(ProcessExit::Running);
    let (kill_tx, kill_rx) = oneshot::channel();
    tokio::spawn(watch_exit(child, kill_rx, exit_tx, sink.clone(), on_exit));

    Ok(SupervisedProcess::new(pid, spec.generation, exit_rx, kill_tx))
}

fn forward<R>(reader: R, stream: Stream, sink: LogSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => sink.append(stream, decode_line(&buf)),
                Err(e) => {
                    log::debug!("stopped reading {:?}: {}", stream, e);
                    break;
                }
            }
        }
    });
}

// Output in a non-UTF-8 locale encoding is kept, with bad bytes replaced.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn watch_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<ProcessExit>,
    sink: LogSink,
    on_exit: ExitHook,
) {
    // A dropped handle also ends the child.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                log::debug!("kill request ignored: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("failed to wait for server process: {}", e);
            None
        }
    };

    sink.note(format!(
        "Process exited with code {}",
        code.map(|c| c.to_string()).unwrap_or_else(|| "none".into())
    ));
    exit.send_replace(ProcessExit::Exited(code));
    on_exit(code);
}
