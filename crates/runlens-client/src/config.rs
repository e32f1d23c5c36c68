//! Client configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use runlens_core::{ReconnectPolicy, DEFAULT_MAX_EVENTS};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Defaults to twice the poll interval.
    #[serde(default)]
    pub stall_after_ms: Option<u64>,
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_api_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_max_buffered_events() -> usize {
    DEFAULT_MAX_EVENTS
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stall_after_ms: None,
            max_buffered_events: default_max_buffered_events(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Reject durations that would stall or spin the poll and reconnect loops.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("reconnect.base_delay_ms", self.reconnect.base_delay_ms),
            ("reconnect.max_delay_ms", self.reconnect.max_delay_ms),
        ];
        for (key, value) in durations {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        if self.stall_after_ms == Some(0) {
            bail!("stall_after_ms must be greater than zero");
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            bail!(
                "reconnect.max_delay_ms ({}) is below reconnect.base_delay_ms ({})",
                self.reconnect.max_delay_ms,
                self.reconnect.base_delay_ms
            );
        }
        if self.max_buffered_events == 0 {
            bail!("max_buffered_events must be greater than zero");
        }
        Ok(())
    }

    /// Load config from `explicit`, then `config/default.toml`, then the
    /// user config dir, falling back to defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        let candidates = [Some(PathBuf::from("config/default.toml")), user_config_path()];
        for path in candidates.into_iter().flatten() {
            if path.exists() {
                info!(target: "runlens::startup", path = %path.display(), "Loading config");
                return Self::load_from(&path);
            }
        }

        Ok(Config::default())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stall_after(&self) -> Duration {
        Duration::from_millis(self.stall_after_ms.unwrap_or(self.poll_interval_ms * 2))
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("runlens").join("config.toml"))
}
