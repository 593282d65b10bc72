//! Supervisor for a local companion backend process.
//!
//! Finds a working interpreter, launches the backend script, polls its health
//! endpoint until it is ready, restarts it when it stops answering, and shuts
//! it down cleanly.

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod process;
pub mod sink;
pub mod supervisor;

pub use config::{Config, Settings};
pub use error::{ErrorKind, MissingPath, ProbeError, SupervisorError};
pub use health::{HealthProber, HealthStatus};
pub use process::{ExitSignal, InterpreterResolver, SupervisedProcess};
pub use sink::{LogLine, LogSink, Stream};
pub use supervisor::{Supervisor, SupervisorState};
