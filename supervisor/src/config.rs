//! `~/.tether/config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::DEFAULT_BUSY_ERROR_CODE;
use crate::watcher::WatcherOptions;
use crate::worker::WorkerOptions;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub worker: WorkerConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Executable that speaks JSON-RPC on stdio. Looked up on `PATH`.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub workspace_path: Option<String>,
    pub busy_error_code: i64,
    pub max_busy_retries: u32,
    pub shutdown_timeout_ms: u64,
    /// Unset means requests may wait indefinitely.
    pub request_timeout_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            workspace_path: None,
            busy_error_code: DEFAULT_BUSY_ERROR_CODE,
            max_busy_retries: 3,
            shutdown_timeout_ms: 2000,
            request_timeout_secs: None,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn options(&self) -> WorkerOptions {
        WorkerOptions {
            busy_error_code: self.busy_error_code,
            max_busy_retries: self.max_busy_retries,
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
        }
    }

    #[must_use]
    pub fn command(&self) -> Option<String> {
        self.command
            .as_deref()
            .map(expand_env_vars)
            .filter(|command| !command.trim().is_empty())
    }

    #[must_use]
    pub fn args(&self) -> Vec<String> {
        self.args.iter().map(|arg| expand_env_vars(arg)).collect()
    }

    #[must_use]
    pub fn workspace_path(&self) -> Option<PathBuf> {
        self.workspace_path
            .as_deref()
            .map(expand_env_vars)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub reconnect_delays_ms: Vec<u64>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconnect_delays_ms: vec![2000, 5000, 10_000, 20_000],
        }
    }
}

impl WatcherConfig {
    #[must_use]
    pub fn options(&self) -> WatcherOptions {
        WatcherOptions {
            reconnect_delays: self
                .reconnect_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        }
    }
}

impl SupervisorConfig {
    /// Load the default config file. `Ok(None)` when there is none.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {}: {source}", path.display());
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        toml::from_str(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {}: {source}", path.display());
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

/// Directory for the config file and logs.
#[must_use]
pub fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tether"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Replace `${VAR}` with the variable's value (empty when unset). `${}` and
/// an unterminated `${` are left as written.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find('}') {
            Some(0) => {
                out.push_str("${}");
                rest = &after[1..];
            }
            Some(close) => {
                out.push_str(&std::env::var(&after[..close]).unwrap_or_default());
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}
