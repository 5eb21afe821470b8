// crates/core/src/config.rs
//! Client configuration.
//!
//! Loaded from `jobwatch.toml` (every field has a default), then overridden
//! by `JOBWATCH_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tail::DEFAULT_CHANNEL_NAMESPACE;

pub const CONFIG_FILE_NAME: &str = "jobwatch.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub logs: LogsConfig,
    pub broker: BrokerConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket endpoint of the job service.
    pub url: String,
    /// Upper bound for one-shot calls. Snapshot streams are never timed out.
    pub request_timeout_secs: u64,
    /// Connection attempts before giving up.
    pub connect_attempts: u32,
    pub max_reconnect_delay_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:6000/api/current".into(),
            request_timeout_secs: 30,
            connect_attempts: 3,
            max_reconnect_delay_secs: 30,
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Prefix of the push channel used for log tailing.
    pub channel_namespace: String,
    /// Per-view log buffer cap in bytes. 0 (the default) keeps everything.
    pub max_log_bytes: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            channel_namespace: DEFAULT_CHANNEL_NAMESPACE.into(),
            max_log_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// How many finished jobs keep their terminal snapshot for late subscribers.
    pub completed_cache_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            completed_cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives.
    pub filter: String,
    pub format: LogFormat,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: "warn,jobwatch=info,jobwatch_core=info,jobwatch_client=info".into(),
            format: LogFormat::Compact,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(path: impl Into<PathBuf>, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.into(),
            message: e.to_string(),
        })
    }

    /// Read and parse one config file. A missing file is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        Self::from_toml_str(path, &text)
    }

    /// Resolve configuration the way the CLI does.
    ///
    /// Priority:
    /// 1. An explicit path (must exist)
    /// 2. `<config dir>/jobwatch/jobwatch.toml` if it exists
    /// 3. Built-in defaults
    ///
    /// Environment overrides are applied last in every case.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::load(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `JOBWATCH_URL`, `JOBWATCH_LOG` and `JOBWATCH_LOG_FORMAT`.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("JOBWATCH_URL") {
            if !url.is_empty() {
                self.connection.url = url;
            }
        }
        if let Ok(filter) = std::env::var("JOBWATCH_LOG") {
            if !filter.is_empty() {
                self.telemetry.filter = filter;
            }
        }
        match std::env::var("JOBWATCH_LOG_FORMAT").as_deref() {
            Ok("json") => self.telemetry.format = LogFormat::Json,
            Ok("compact") => self.telemetry.format = LogFormat::Compact,
            Ok(other) => tracing::warn!(format = other, "unknown JOBWATCH_LOG_FORMAT, ignoring"),
            Err(_) => {}
        }
    }
}

/// `<config dir>/jobwatch/jobwatch.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("jobwatch").join(CONFIG_FILE_NAME))
}
