//! Configuration loading and validation.
//!
//! Loads `config.toml` from `$CELLCHAT_CONFIG_PATH` or the user config
//! directory (`~/.config/cellchat/config.toml` on Linux). Environment
//! variables override file values; file values override defaults. A missing
//! file is not an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Longest relative validity a GSM network accepts (63 weeks), in minutes.
const MAX_VALIDITY_MINUTES: u32 = 63 * 7 * 24 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Messaging behaviour.
    pub account: AccountConfig,
    /// Stuck-message deadlines.
    pub reaper: ReaperConfig,
    /// On-disk locations.
    pub paths: PathsConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Static `number = "name"` contact table.
    pub contacts: HashMap<String, String>,
}

/// Messaging behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// ISO 3166 alpha-2 region used when the SIM does not reveal one.
    pub country: Option<String>,
    /// Request delivery reports for outbound SMS.
    pub delivery_reports: bool,
    /// Relative validity of outbound SMS at the service centre, in minutes.
    pub validity_minutes: u32,
    /// Delay before re-reading a message reference that read as unknown.
    pub reference_retry_ms: u64,
    /// Capacity of the account's command and event channels.
    pub event_buffer: usize,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            country: None,
            delivery_reports: true,
            validity_minutes: 7 * 24 * 60,
            reference_retry_ms: 3000,
            event_buffer: 128,
        }
    }
}

impl AccountConfig {
    /// Reference re-read delay.
    pub fn reference_retry(&self) -> Duration {
        Duration::from_millis(self.reference_retry_ms)
    }

    /// Relative validity, clamped to what the network accepts.
    pub fn validity(&self) -> u32 {
        self.validity_minutes.clamp(1, MAX_VALIDITY_MINUTES)
    }
}

/// Stuck-message deadlines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// How long past its timestamp an incomplete entry may stay queued.
    pub long_timeout_hours: u64,
    /// Window used when the entry has no usable timestamp.
    pub short_timeout_hours: u64,
    /// Delay used when the long deadline has already passed.
    pub minimal_timeout_secs: u64,
    /// How far in the future a timestamp may be before the clock is
    /// considered wrong.
    pub clock_skew_tolerance_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            long_timeout_hours: 7 * 24,
            short_timeout_hours: 2 * 24,
            minimal_timeout_secs: 1,
            clock_skew_tolerance_secs: 3600,
        }
    }
}

impl ReaperConfig {
    /// Long timeout as a duration.
    pub fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.long_timeout_hours.saturating_mul(3600))
    }

    /// Short timeout as a duration.
    pub fn short_timeout(&self) -> Duration {
        Duration::from_secs(self.short_timeout_hours.saturating_mul(3600))
    }

    /// Minimal timeout as a duration.
    pub fn minimal_timeout(&self) -> Duration {
        Duration::from_secs(self.minimal_timeout_secs)
    }

    /// Clock skew tolerance as a duration.
    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.clock_skew_tolerance_secs)
    }
}

/// On-disk locations. Unset paths resolve under the user data directory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite history database.
    pub database: Option<PathBuf>,
    /// Directory for rotated JSON logs.
    pub logs: Option<PathBuf>,
}

/// Log output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Config {
    /// Load with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let path = match std::env::var("CELLCHAT_CONFIG_PATH") {
            Ok(p) => PathBuf::from(p),
            Err(_) => config_dir()?.join("config.toml"),
        };
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrong types.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment overrides through a resolver (tests pass a closure).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CELLCHAT_COUNTRY") {
            let v = v.trim().to_ascii_uppercase();
            self.account.country = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = env("CELLCHAT_DB_PATH") {
            self.paths.database = Some(PathBuf::from(v));
        }
        if let Some(v) = env("CELLCHAT_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("CELLCHAT_DELIVERY_REPORTS") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.account.delivery_reports = true,
                "0" | "false" | "no" | "off" => self.account.delivery_reports = false,
                _ => tracing::warn!(
                    var = "CELLCHAT_DELIVERY_REPORTS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Resolved history database path.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the data directory
    /// cannot be determined.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.paths.database {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("history.db")),
        }
    }

    /// Resolved log directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the data directory
    /// cannot be determined.
    pub fn logs_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.paths.logs {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("logs")),
        }
    }
}

/// Resolve the config directory (`<config dir>/cellchat`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(base.config_dir().join("cellchat"))
}

/// Resolve the data directory (`<data dir>/cellchat`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(base.data_dir().join("cellchat"))
}
