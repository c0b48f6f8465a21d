//! Sync layer configuration.
//!
//! Values come from `~/.config/wardsync/config.json` when present, then from
//! the environment (a `.env` file is honored). Every field has a default, so
//! an empty or partial file is fine.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::RetryPolicy;
use crate::auth::{MonitorConfig, CREDENTIAL_KEY, DEFAULT_REFRESH_PATH};
use crate::cache::{StoreConfig, DEFAULT_RETENTION_SECS};

/// Application name used for the config directory path
const APP_NAME: &str = "wardsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_BASE_URL: &str = "WARDSYNC_API_BASE_URL";
pub const ENV_REQUEST_TIMEOUT: &str = "WARDSYNC_REQUEST_TIMEOUT_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "WARDSYNC_MAX_ATTEMPTS";
pub const ENV_RETENTION: &str = "WARDSYNC_RETENTION_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_unit_ms: u64,
    pub settle_delay_ms: u64,
    pub retention_secs: u64,
    pub max_age_secs: Option<u64>,
    pub session_check_interval_secs: u64,
    pub session_min_spacing_secs: u64,
    pub refresh_path: String,
    pub credential_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            request_timeout_secs: 30,
            max_attempts: 3,
            backoff_unit_ms: 1000,
            settle_delay_ms: 1000,
            retention_secs: DEFAULT_RETENTION_SECS,
            max_age_secs: None,
            session_check_interval_secs: 30,
            session_min_spacing_secs: 10,
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            credential_key: CREDENTIAL_KEY.to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        let _ = dotenvy::dotenv();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, ignoring any config file.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var(ENV_BASE_URL) {
            self.base_url = url;
        }
        if let Some(raw) = var(ENV_REQUEST_TIMEOUT) {
            self.request_timeout_secs = parse_var(ENV_REQUEST_TIMEOUT, &raw)?;
        }
        if let Some(raw) = var(ENV_MAX_ATTEMPTS) {
            self.max_attempts = parse_var(ENV_MAX_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = var(ENV_RETENTION) {
            self.retention_secs = parse_var(ENV_RETENTION, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        reqwest::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid API base URL: {}", self.base_url))?;
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            retention: Duration::from_secs(self.retention_secs),
            max_age: self.max_age_secs.map(Duration::from_secs),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.session_check_interval_secs),
            min_spacing: Duration::from_secs(self.session_min_spacing_secs),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", name, raw))
}
