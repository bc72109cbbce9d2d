//! Configuration module
//!
//! Read from a TOML file (`~/.config/texnouz-roaming/config.toml` by default).
//! Every field has a default, so a partial file is enough.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ConfigError;

/// Upper bound for every timer period and budget (30 days)
pub const MAX_PERIOD_SECS: u64 = 30 * 24 * 60 * 60;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub sync: SyncConfig,
    pub features: FeatureToggles,
    pub authorization: AuthorizationConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("sync.full_sync_every_secs", self.sync.full_sync_every_secs),
            ("sync.status_every_secs", self.sync.status_every_secs),
            ("sync.cdr_every_secs", self.sync.cdr_every_secs),
            ("sync.status_refresh_every_secs", self.sync.status_refresh_every_secs),
            ("sync.request_timeout_secs", self.sync.request_timeout_secs),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
            if value > MAX_PERIOD_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} must not exceed {} seconds",
                    name, MAX_PERIOD_SECS
                )));
            }
        }
        if self.sync.cdr_lock_wait_ms > MAX_PERIOD_SECS * 1000 {
            return Err(ConfigError::Invalid(format!(
                "sync.cdr_lock_wait_ms must not exceed {} ms",
                MAX_PERIOD_SECS * 1000
            )));
        }
        if self.authorization.log_file_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "authorization.log_file_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default config location
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("texnouz-roaming")
        .join("config.toml")
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. "info" or "texnouz_roaming=debug"
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Flush timer periods and resource budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Full-sync cycle (add/update/remove + delayed status)
    pub full_sync_every_secs: u64,
    /// Fast status cycle
    pub status_every_secs: u64,
    /// CDR queue flush
    pub cdr_every_secs: u64,
    /// Periodic full status refresh
    pub status_refresh_every_secs: u64,
    /// Budget for a single upstream request
    pub request_timeout_secs: u64,
    /// Budget for acquiring the CDR queue lock
    pub cdr_lock_wait_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            full_sync_every_secs: 31,
            status_every_secs: 3,
            cdr_every_secs: 15,
            status_refresh_every_secs: 12 * 60 * 60,
            request_timeout_secs: 60,
            cdr_lock_wait_ms: 120_000,
        }
    }
}

impl SyncConfig {
    pub fn full_sync_every(&self) -> Duration {
        Duration::from_secs(self.full_sync_every_secs)
    }

    pub fn status_every(&self) -> Duration {
        Duration::from_secs(self.status_every_secs)
    }

    pub fn cdr_every(&self) -> Duration {
        Duration::from_secs(self.cdr_every_secs)
    }

    pub fn status_refresh_every(&self) -> Duration {
        Duration::from_secs(self.status_refresh_every_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cdr_lock_wait(&self) -> Duration {
        Duration::from_millis(self.cdr_lock_wait_ms)
    }
}

/// Administrative switches; a disabled feature answers `AdminDown`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    pub disable_push_data: bool,
    pub disable_push_status: bool,
    pub disable_status_refresh: bool,
    pub disable_send_cdrs: bool,
    pub disable_authorization: bool,
}

/// Authorization cache persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Directory holding the monthly log files
    pub log_directory: PathBuf,
    pub log_file_prefix: String,
    /// Append a REMOVE record when upstream denies a cached token
    pub persist_denials: bool,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            log_directory: PathBuf::from("data"),
            log_file_prefix: "roaming_authorizations".to_string(),
            persist_denials: false,
        }
    }
}
