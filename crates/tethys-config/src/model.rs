//! Typed session configuration and its environment loader.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::defaults::{self, env};
use crate::error::ConfigResult;
use crate::validate::{
    non_blank, parse_capacity, parse_database_url, parse_interval_ms, parse_log_format,
};

/// Runtime settings for a session process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    /// Durable store connection string.
    pub database_url: String,
    /// Root directory new torrents are saved under.
    pub download_root: PathBuf,
    /// Cadence of transfer status polling.
    pub poll_interval: Duration,
    /// Transport notification channel capacity.
    pub notification_buffer: usize,
    /// Log filter directive.
    pub log_level: String,
    /// Explicit log format (`json` or `pretty`); inferred from the build when absent.
    pub log_format: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            download_root: PathBuf::from(defaults::DOWNLOAD_ROOT),
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
            notification_buffer: defaults::NOTIFICATION_BUFFER,
            log_level: defaults::LOG_LEVEL.to_string(),
            log_format: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::InvalidField`] when a variable is set to
    /// a value that cannot be parsed or is out of range.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Missing or blank keys fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::InvalidField`] when a value is malformed.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| non_blank(lookup(key));
        let mut config = Self::default();

        if let Some(raw) = read(env::DATABASE_URL) {
            config.database_url = parse_database_url(env::DATABASE_URL, &raw)?;
        }
        if let Some(raw) = read(env::DOWNLOAD_ROOT) {
            config.download_root = PathBuf::from(raw);
        }
        if let Some(raw) = read(env::POLL_INTERVAL_MS) {
            config.poll_interval = parse_interval_ms(
                env::POLL_INTERVAL_MS,
                &raw,
                defaults::MIN_POLL_INTERVAL_MS,
                defaults::MAX_POLL_INTERVAL_MS,
            )?;
        }
        if let Some(raw) = read(env::NOTIFICATION_BUFFER) {
            config.notification_buffer = parse_capacity(env::NOTIFICATION_BUFFER, &raw)?;
        }
        if let Some(raw) = read(env::LOG_LEVEL) {
            config.log_level = raw;
        }
        if let Some(raw) = read(env::LOG_FORMAT) {
            config.log_format = Some(parse_log_format(env::LOG_FORMAT, &raw)?);
        }

        tracing::debug!(
            database_url = %config.database_url,
            download_root = %config.download_root.display(),
            poll_interval_ms = config.poll_interval.as_millis(),
            "session configuration loaded"
        );
        Ok(config)
    }
}
