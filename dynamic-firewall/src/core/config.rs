/*!
Configuration management for the firewall sync daemon
*/

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// A collector or backend section lacks a required setting.
    #[error("{component}: {field} not configured")]
    MissingSetting { component: String, field: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    /// Collector sections keyed by registry name, e.g. `[collectors.ipsum]`
    #[serde(default)]
    pub collectors: BTreeMap<String, toml::Value>,
    /// Backend sections keyed by registry name, e.g. `[backends.unifi]`
    #[serde(default)]
    pub backends: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Seconds between collection runs, and between reconciliation runs
    #[serde(default = "default_update_interval")]
    pub update_interval: u64,
    /// Minimum merged score for an address to be pushed to firewalls
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    /// Records not seen for this many days are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upper bound for one collector fetch or one backend converge
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

/// One year
pub const MAX_UPDATE_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

pub const MAX_RETENTION_DAYS: u32 = 36_500;

fn default_update_interval() -> u64 {
    3600
}

fn default_min_score() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/ips.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    120
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
            min_score: default_min_score(),
            retention_days: default_retention_days(),
            db_path: default_db_path(),
            log_level: default_log_level(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl GlobalConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Retention age, or `None` when purging is disabled (`retention_days = 0`).
    pub fn retention(&self) -> Option<TimeDelta> {
        (self.retention_days > 0).then(|| TimeDelta::days(i64::from(self.retention_days)))
    }
}

impl FirewallConfig {
    /// Load from a TOML file; a missing file yields the built-in defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse a TOML document, resolving `${VAR}` placeholders from the process environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Self::from_toml_str_with(content, |name| std::env::var(name).ok())
    }

    pub fn from_toml_str_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let table = content.parse::<toml::Table>()?;
        let resolved = substitute_env(toml::Value::Table(table), &lookup);
        let config: FirewallConfig = resolved.try_into()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.global.update_interval == 0 {
            return Err(ConfigError::Invalid("global.update_interval must be positive".into()));
        }
        if self.global.update_interval > MAX_UPDATE_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "global.update_interval must be at most {} seconds",
                MAX_UPDATE_INTERVAL_SECS
            )));
        }
        if self.global.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Invalid(format!(
                "global.retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.global.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid("global.fetch_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Replace strings of the exact form `${VAR}` with the variable's value when it is set.
fn substitute_env<F>(value: toml::Value, lookup: &F) -> toml::Value
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        toml::Value::String(s) => {
            let replaced = placeholder_name(&s).and_then(lookup);
            replaced.map(toml::Value::String).unwrap_or(toml::Value::String(s))
        }
        toml::Value::Array(items) => {
            toml::Value::Array(items.into_iter().map(|item| substitute_env(item, lookup)).collect())
        }
        toml::Value::Table(table) => toml::Value::Table(
            table
                .into_iter()
                .map(|(key, item)| (key, substitute_env(item, lookup)))
                .collect(),
        ),
        other => other,
    }
}

fn placeholder_name(s: &str) -> Option<&str> {
    s.strip_prefix("${")?.strip_suffix('}').filter(|name| !name.is_empty())
}

/// Whether a collector or backend section has `enabled = true`.
pub fn section_enabled(section: &toml::Value) -> bool {
    section
        .get("enabled")
        .and_then(toml::Value::as_bool)
        .unwrap_or(false)
}

/// A credential or endpoint that must be present for a component to register.
///
/// Empty strings and placeholders whose variable was never set count as missing.
pub fn require_setting(
    value: Option<&str>,
    component: &str,
    field: &str,
) -> Result<String, ConfigError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() && placeholder_name(v).is_none() => Ok(v.to_string()),
        _ => Err(ConfigError::MissingSetting {
            component: component.to_string(),
            field: field.to_string(),
        }),
    }
}
