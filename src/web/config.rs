// Runtime configuration: JSON file (optional) + LLAMA_PROXY_* env overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::worker::supervisor::SupervisorSettings;

pub const MIN_METRICS_INTERVAL_MS: u64 = 100;
pub const MAX_METRICS_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_METRICS_INTERVAL_MS: u64 = 3_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub console: bool,
    pub file: bool,
    pub file_path: PathBuf,
    pub max_file_bytes: u64,
    /// Number of rolled archives kept next to `file_path`.
    pub file_count: u32,
    pub live_broadcast: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: true,
            file_path: PathBuf::from("logs/llama_proxy.log"),
            max_file_bytes: 10 * 1024 * 1024,
            file_count: 5,
            live_broadcast: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub history_file: Option<PathBuf>,
    /// One worker binary per model id lives here.
    pub workers_dir: PathBuf,
    /// Arguments passed to every worker; `{model_id}` is substituted.
    pub worker_args: Vec<String>,
    /// A stdout/stderr line matching this marks the worker as ready.
    pub ready_pattern: String,
    pub launch_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub kill_wait_ms: u64,
    pub stderr_tail_lines: usize,
    pub metrics_interval_ms: u64,
    pub history_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4100".to_string(),
            data_dir: PathBuf::from("data"),
            state_file: None,
            history_file: None,
            workers_dir: PathBuf::from("workers"),
            worker_args: vec!["--model-id".to_string(), "{model_id}".to_string()],
            ready_pattern: r"(?i)server is listening|model loaded|\bready\b".to_string(),
            launch_timeout_ms: 30_000,
            stop_grace_ms: 5_000,
            kill_wait_ms: 2_000,
            stderr_tail_lines: 20,
            metrics_interval_ms: DEFAULT_METRICS_INTERVAL_MS,
            history_capacity: 1_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Load from `path` (defaults if `None`), apply env overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("LLAMA_PROXY_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = lookup("LLAMA_PROXY_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("LLAMA_PROXY_WORKERS_DIR") {
            self.workers_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("LLAMA_PROXY_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "bind_addr '{}' is not a socket address",
                self.bind_addr
            )));
        }
        if self.launch_timeout_ms == 0 {
            return Err(ConfigError::Invalid("launch_timeout_ms must be > 0".to_string()));
        }
        if self.stop_grace_ms == 0 || self.kill_wait_ms == 0 {
            return Err(ConfigError::Invalid(
                "stop_grace_ms and kill_wait_ms must be > 0".to_string(),
            ));
        }
        if !(MIN_METRICS_INTERVAL_MS..=MAX_METRICS_INTERVAL_MS).contains(&self.metrics_interval_ms) {
            return Err(ConfigError::Invalid(format!(
                "metrics_interval_ms must be within {MIN_METRICS_INTERVAL_MS}..={MAX_METRICS_INTERVAL_MS}"
            )));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be > 0".to_string()));
        }
        if self.logging.file && self.logging.file_count == 0 {
            return Err(ConfigError::Invalid("logging.file_count must be > 0".to_string()));
        }
        self.ready_regex().map(|_| ())
    }

    fn ready_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.ready_pattern)
            .map_err(|e| ConfigError::Invalid(format!("ready_pattern: {e}")))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("llama_state.json"))
    }

    pub fn history_path(&self) -> PathBuf {
        self.history_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("metrics_history.jsonl"))
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn supervisor_settings(&self) -> Result<SupervisorSettings, ConfigError> {
        Ok(SupervisorSettings {
            workers_dir: self.workers_dir.clone(),
            worker_args: self.worker_args.clone(),
            ready_pattern: self.ready_regex()?,
            launch_timeout: Duration::from_millis(self.launch_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            kill_wait: Duration::from_millis(self.kill_wait_ms),
            stderr_tail_lines: self.stderr_tail_lines,
        })
    }
}
