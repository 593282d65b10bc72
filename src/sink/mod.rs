//! Append-only log sink for the supervised process's output.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use parking_lot::Mutex;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Where a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
    Supervisor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: Stream,
    pub text: String,
}

impl LogLine {
    /// Render the line the way it is written to the log file.
    pub fn render(&self) -> String {
        match self.stream {
            Stream::Stdout => self.text.clone(),
            Stream::Stderr => format!("[Error] {}", self.text),
            Stream::Supervisor => format!("[sidecar] {}", self.text),
        }
    }
}

struct Inner {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
    file: Mutex<Option<File>>,
    echo: AtomicBool,
}

/// Session-scoped output channel. Clones share the same buffer.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSink")
            .field("capacity", &self.inner.capacity)
            .field("echo", &self.inner.echo.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogSink {
    /// In-memory sink holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                lines: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
                capacity: capacity.max(1),
                file: Mutex::new(None),
                echo: AtomicBool::new(false),
            }),
        }
    }

    /// Also append every line to `path`, creating parent directories as needed.
    pub fn with_file(self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        *self.inner.file.lock() = Some(file);
        Ok(self)
    }

    /// Echo lines to the terminal as they arrive.
    pub fn with_echo(self, echo: bool) -> Self {
        self.inner.echo.store(echo, Ordering::Relaxed);
        self
    }

    pub fn append(&self, stream: Stream, text: impl Into<String>) {
        let line = LogLine {
            stream,
            text: text.into(),
        };

        match stream {
            Stream::Supervisor => log::info!("{}", line.text),
            Stream::Stdout => log::debug!(target: "sidecar::child", "{}", line.text),
            Stream::Stderr => log::debug!(target: "sidecar::child", "[stderr] {}", line.text),
        }

        // Supervisor notes already reach the terminal through the logger.
        if self.inner.echo.load(Ordering::Relaxed) {
            match stream {
                Stream::Stdout => eprintln!("{}", line.text.dimmed()),
                Stream::Stderr => eprintln!("{}", line.render().red()),
                Stream::Supervisor => {}
            }
        }

        if let Some(file) = self.inner.file.lock().as_mut() {
            if let Err(e) = writeln!(file, "{}", line.render()) {
                log::warn!("failed to write server log: {}", e);
            }
        }

        let mut lines = self.inner.lines.lock();
        if lines.len() == self.inner.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// A line written by the supervisor itself.
    pub fn note(&self, text: impl Into<String>) {
        self.append(Stream::Supervisor, text);
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.inner.lines.lock().iter().cloned().collect()
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let lines = self.inner.lines.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect()
    }
}
