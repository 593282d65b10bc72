use std::{
    collections::HashMap,
    env,
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::BaseDirs;

/// Interpreter used when no candidate passes its version check.
pub const DEFAULT_INTERPRETER: &str = "python";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_HEALTH_PATH: &str = "/api/health_check";
pub const DEFAULT_SERVER_SCRIPT: &str = "python_server/main.py";

#[derive(Debug, Clone)]
pub struct Config {
    inner: HashMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(&default_config_path())
    }

    /// Read `KEY=value` lines from `path`, then overlay the environment.
    pub fn load_from(path: &Path) -> Self {
        let mut map = default_map();

        if path.exists() {
            if let Ok(file) = fs::File::open(path) {
                let reader = BufReader::new(file);
                for line in reader.lines().map_while(Result::ok) {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((k, v)) = line.split_once('=') {
                        map.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
        }

        // Environment takes precedence over the rc file
        for (k, v) in env::vars() {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self {
            inner: map,
            config_path: path.to_path_buf(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned().filter(|v| !v.is_empty())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse::<u64>().ok())
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner.insert(key.to_string(), value.into());
    }
}

fn is_config_key(k: &str) -> bool {
    k.starts_with("SIDECAR_")
}

fn default_config_path() -> PathBuf {
    let base = BaseDirs::new()
        .map(|b| b.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("~/.config"));
    base.join("sidecar").join(".sidecarrc")
}

fn default_map() -> HashMap<String, String> {
    let mut m = HashMap::new();

    m.insert("SIDECAR_SERVER_URL".into(), DEFAULT_SERVER_URL.into());
    m.insert("SIDECAR_HEALTH_PATH".into(), DEFAULT_HEALTH_PATH.into());
    m.insert("SIDECAR_SERVER_SCRIPT".into(), DEFAULT_SERVER_SCRIPT.into());

    // Milliseconds unless the key says otherwise
    m.insert("SIDECAR_STARTUP_TIMEOUT_MS".into(), "10000".into());
    m.insert("SIDECAR_PROBE_TIMEOUT_MS".into(), "2000".into());
    m.insert("SIDECAR_POLL_INTERVAL_MS".into(), "500".into());
    m.insert("SIDECAR_VERSION_CHECK_TIMEOUT_MS".into(), "5000".into());
    m.insert("SIDECAR_STOP_TIMEOUT_MS".into(), "5000".into());
    m.insert("SIDECAR_WATCHDOG_INTERVAL_SECS".into(), "30".into());
    m.insert("SIDECAR_LOG_BUFFER_LINES".into(), "1000".into());

    m
}

/// Typed view of [`Config`] consumed by the supervisor.
#[derive(Debug, Clone)]
pub struct Settings {
    /// User-chosen interpreter, tried before the built-in fallbacks
    pub interpreter: Option<String>,
    pub server_url: String,
    pub health_path: String,
    /// Absolute path of the backend entry script
    pub script_path: PathBuf,
    pub startup_timeout: Duration,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub version_check_timeout: Duration,
    pub stop_timeout: Duration,
    pub watchdog_interval: Duration,
    pub log_file: Option<PathBuf>,
    pub log_buffer_lines: usize,
}

impl Settings {
    pub fn from_config(cfg: &Config) -> Self {
        let ms = |key: &str, default: u64| Duration::from_millis(cfg.get_u64(key).unwrap_or(default));

        let script = cfg
            .get_path("SIDECAR_SERVER_SCRIPT")
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_SCRIPT));

        Self {
            interpreter: cfg.get("SIDECAR_INTERPRETER"),
            server_url: cfg
                .get("SIDECAR_SERVER_URL")
                .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            health_path: cfg
                .get("SIDECAR_HEALTH_PATH")
                .unwrap_or_else(|| DEFAULT_HEALTH_PATH.to_string()),
            script_path: absolutize(&script),
            startup_timeout: ms("SIDECAR_STARTUP_TIMEOUT_MS", 10_000),
            probe_timeout: ms("SIDECAR_PROBE_TIMEOUT_MS", 2_000),
            poll_interval: ms("SIDECAR_POLL_INTERVAL_MS", 500),
            version_check_timeout: ms("SIDECAR_VERSION_CHECK_TIMEOUT_MS", 5_000),
            stop_timeout: ms("SIDECAR_STOP_TIMEOUT_MS", 5_000),
            watchdog_interval: Duration::from_secs(
                cfg.get_u64("SIDECAR_WATCHDOG_INTERVAL_SECS").unwrap_or(30),
            ),
            log_file: cfg.get_path("SIDECAR_LOG_FILE"),
            log_buffer_lines: cfg
                .get_u64("SIDECAR_LOG_BUFFER_LINES")
                .map(|n| n as usize)
                .unwrap_or(crate::sink::DEFAULT_CAPACITY),
        }
    }

    /// Settings for a given script with every other value at its default.
    pub fn for_script(script: impl AsRef<Path>) -> Self {
        let mut settings = Self::from_config(&Config {
            inner: default_map(),
            config_path: PathBuf::new(),
        });
        settings.script_path = absolutize(script.as_ref());
        settings
    }

    /// Full URL of the health endpoint.
    pub fn health_url(&self) -> String {
        join_url(&self.server_url, &self.health_path)
    }

    /// Directory the backend runs in: the script's parent.
    pub fn working_dir(&self) -> PathBuf {
        self.script_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
