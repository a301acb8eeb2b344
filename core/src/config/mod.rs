//! Configuration management
//!
//! `SeekerConfig` is read from `seeker.toml`, searched in the current
//! directory and then `~/.config/seeker/seeker.toml`. Missing files fall back
//! to defaults; `SEEKER_*` environment variables override individual fields.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backoff::Backoff;
use crate::request::{RequestKind, Response};
use crate::scheduler::SchedulerConfig;


/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error occurred while reading/writing config file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
    /// TOML serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    /// A value is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeekerConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub requests: RequestConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub client: ClientConfig,
}

/// WebSocket server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the observer endpoint listens on
    pub bind: String,
    /// Outbound frames buffered per observer before it is evicted
    pub observer_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8765".to_string(),
            observer_buffer: 256,
        }
    }
}

/// Request timeouts, fail-safe defaults and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub input_timeout_secs: u64,
    pub approval_timeout_secs: u64,
    /// Value an unanswered input request resolves to
    pub no_input_value: String,
    /// How long settled requests are kept to absorb late duplicates
    pub retention_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            input_timeout_secs: 300,
            approval_timeout_secs: 300,
            no_input_value: "no input".to_string(),
            retention_secs: 60,
            sweep_interval_secs: 1,
        }
    }
}

impl RequestConfig {
    pub fn timeout_for(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::Input => Duration::from_secs(self.input_timeout_secs),
            RequestKind::Approval => Duration::from_secs(self.approval_timeout_secs),
        }
    }

    /// Fail-safe response for a kind. Approvals always default to deny.
    pub fn default_response(&self, kind: RequestKind) -> Response {
        match kind {
            RequestKind::Input => Response::text(self.no_input_value.clone()),
            RequestKind::Approval => Response::deny(Some("no response before timeout".to_string())),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Auto-continue settings for observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Settling delay after a turn with tool activity
    pub immediate_delay_ms: u64,
    /// Delay after a quiet turn
    pub idle_delay_secs: u64,
    pub start_paused: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            immediate_delay_ms: 750,
            idle_delay_secs: 60,
            start_paused: false,
        }
    }
}

impl SchedulerSettings {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            immediate_delay: Duration::from_millis(self.immediate_delay_ms),
            idle_delay: Duration::from_secs(self.idle_delay_secs),
            start_paused: self.start_paused,
        }
    }
}

/// Observer client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Pause between answering one prompt and showing the next
    pub transition_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            transition_ms: 300,
        }
    }
}

impl ClientConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn transition(&self) -> Duration {
        Duration::from_millis(self.transition_ms)
    }
}

impl SeekerConfig {
    /// Load configuration from the first `seeker.toml` found, apply
    /// environment overrides and validate.
    ///
    /// Searches `./seeker.toml` then `~/.config/seeker/seeker.toml`; if
    /// neither exists the defaults are used.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::locate() {
            Some(path) => Self::load_from(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SeekerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The file `load` would read, if any
    pub fn locate() -> Option<PathBuf> {
        let local = PathBuf::from("seeker.toml");
        if local.exists() {
            return Some(local);
        }
        Self::user_config_path().filter(|p| p.exists())
    }

    /// `~/.config/seeker/seeker.toml` or the platform equivalent
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("seeker").join("seeker.toml"))
    }

    /// Apply `SEEKER_*` environment variable overrides
    ///
    /// - `SEEKER_BIND` → `server.bind`
    /// - `SEEKER_URL` → `client.url`
    /// - `SEEKER_INPUT_TIMEOUT_SECS` → `requests.input_timeout_secs`
    /// - `SEEKER_APPROVAL_TIMEOUT_SECS` → `requests.approval_timeout_secs`
    /// - `SEEKER_IDLE_DELAY_SECS` → `scheduler.idle_delay_secs`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with an
    /// explicit lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(bind) = non_empty("SEEKER_BIND") {
            self.server.bind = bind;
        }
        if let Some(url) = non_empty("SEEKER_URL") {
            self.client.url = url;
        }

        let numeric = |key: &str, target: &mut u64| {
            if let Some(raw) = non_empty(key) {
                match raw.trim().parse::<u64>() {
                    Ok(value) => *target = value,
                    Err(_) => tracing::warn!(key, value = %raw, "ignoring non-numeric override"),
                }
            }
        };
        numeric("SEEKER_INPUT_TIMEOUT_SECS", &mut self.requests.input_timeout_secs);
        numeric(
            "SEEKER_APPROVAL_TIMEOUT_SECS",
            &mut self.requests.approval_timeout_secs,
        );
        numeric("SEEKER_IDLE_DELAY_SECS", &mut self.scheduler.idle_delay_secs);
    }

    /// Reject values that would make requests expire instantly or spin the
    /// sweeper.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let requests = &self.requests;
        if requests.input_timeout_secs == 0 || requests.approval_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request timeouts must be at least one second".to_string(),
            ));
        }
        if requests.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "requests.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.server.observer_buffer == 0 {
            return Err(ConfigError::Invalid(
                "server.observer_buffer must be positive".to_string(),
            ));
        }
        if self.client.backoff_initial_ms == 0
            || self.client.backoff_max_ms < self.client.backoff_initial_ms
        {
            return Err(ConfigError::Invalid(
                "client backoff must start above zero and not exceed its cap".to_string(),
            ));
        }
        Ok(())
    }
}
