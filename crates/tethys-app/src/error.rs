//! # Design
//!
//! - Centralize application-level errors for bootstrap and shutdown.
//! - Keep error messages constant while carrying context fields for debugging.
//! - Preserve source errors without re-logging at call sites.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Result alias for application operations.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level error type.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration could not be loaded.
    #[error("configuration operation failed")]
    Config {
        /// Operation identifier.
        operation: &'static str,
        /// Source configuration error.
        source: tethys_config::ConfigError,
    },
    /// Telemetry operations failed.
    #[error("telemetry operation failed")]
    Telemetry {
        /// Operation identifier.
        operation: &'static str,
        /// Source telemetry error.
        source: tethys_telemetry::TelemetryError,
    },
    /// The durable store could not be opened.
    #[error("runtime persistence failed")]
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Source store error.
        source: Box<dyn StdError + Send + Sync>,
    },
    /// Session engine operations failed.
    #[error("torrent operation failed")]
    Session {
        /// Operation identifier.
        operation: &'static str,
        /// Source torrent error.
        source: tethys_torrent_core::TorrentError,
    },
    /// IO operations failed.
    #[error("io operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Source IO error.
        source: io::Error,
    },
}

impl AppError {
    pub(crate) const fn config(
        operation: &'static str,
        source: tethys_config::ConfigError,
    ) -> Self {
        Self::Config { operation, source }
    }

    pub(crate) const fn telemetry(
        operation: &'static str,
        source: tethys_telemetry::TelemetryError,
    ) -> Self {
        Self::Telemetry { operation, source }
    }

    pub(crate) fn store(
        operation: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::Store {
            operation,
            source: source.into(),
        }
    }

    pub(crate) const fn session(
        operation: &'static str,
        source: tethys_torrent_core::TorrentError,
    ) -> Self {
        Self::Session { operation, source }
    }
}
