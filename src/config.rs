use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::db::DB_PATH;

const ENV_PREFIX: &str = "CRM";

/// Runtime settings. Defaults live here; `CRM_*` environment variables override
/// them and CLI flags override both (see `main.rs`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// `None` keeps polling until the loading indicator is gone.
    #[serde(default)]
    pub max_load_polls: Option<u32>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub use_lock: bool,
    #[serde(default = "default_lock_expiry_ms")]
    pub lock_expiry_ms: u64,
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
}

fn default_db_path() -> String {
    DB_PATH.to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_lock_expiry_ms() -> u64 {
    5000
}

fn default_lock_retries() -> u32 {
    3
}

fn default_lock_backoff_ms() -> u64 {
    500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            poll_interval_ms: default_poll_interval_ms(),
            max_load_polls: None,
            debounce_ms: default_debounce_ms(),
            use_lock: false,
            lock_expiry_ms: default_lock_expiry_ms(),
            lock_retries: default_lock_retries(),
            lock_backoff_ms: default_lock_backoff_ms(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::from_env(config::Environment::with_prefix(ENV_PREFIX))
    }

    fn from_env(env: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(env.try_parsing(true))
            .build()
            .context("Failed to read CRM_* settings")?
            .try_deserialize()
            .context("Invalid CRM_* settings")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn lock_expiry(&self) -> Duration {
        Duration::from_millis(self.lock_expiry_ms)
    }

    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn defaults_without_env() {
        let settings = Settings::from_env(env(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.poll_interval(), Duration::from_millis(500));
        assert_eq!(settings.max_load_polls, None);
        assert!(!settings.use_lock);
    }

    #[test]
    fn env_overrides() {
        let settings = Settings::from_env(env(&[
            ("CRM_DB_PATH", "/tmp/crm-test.sqlite"),
            ("CRM_MAX_LOAD_POLLS", "20"),
            ("CRM_USE_LOCK", "true"),
            ("CRM_DEBOUNCE_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(settings.db_path, "/tmp/crm-test.sqlite");
        assert_eq!(settings.max_load_polls, Some(20));
        assert!(settings.use_lock);
        assert_eq!(settings.debounce(), Duration::from_millis(250));
        assert_eq!(settings.lock_retries, 3);
    }
}
