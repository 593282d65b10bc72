use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "sidecar", about = "Supervise a local companion backend process", version)]
pub struct Cli {
    /// Backend entry script (overrides SIDECAR_SERVER_SCRIPT).
    #[arg(long, global = true, value_name = "PATH")]
    pub script: Option<PathBuf>,

    /// Interpreter to try before the built-in fallbacks.
    #[arg(long, global = true, value_name = "CMD")]
    pub interpreter: Option<String>,

    /// Backend base URL (overrides SIDECAR_SERVER_URL).
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Readiness budget in milliseconds.
    #[arg(long = "startup-timeout", global = true, value_name = "MS")]
    pub startup_timeout: Option<u64>,

    /// Also append server output to this file.
    #[arg(long = "log-file", global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG still wins when set).
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the backend and keep it healthy until Ctrl-C.
    Run {
        /// Seconds between watchdog health checks.
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,
    },
    /// Probe the health endpoint once.
    Check,
    /// Print the interpreter that would be used to launch the backend.
    Resolve,
    /// Ensure the backend is running, GET a path and print the JSON response.
    Call {
        /// Path under the backend base URL, e.g. /api/dashboard.
        path: String,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
