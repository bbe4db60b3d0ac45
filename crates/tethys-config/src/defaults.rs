//! Default values and bounds for session configuration.
//!
//! # Design
//! - Centralize defaults so the loader and its tests agree on them.
//! - Keep interval bounds explicit; the poller must never spin or stall.

/// Default durable store location.
pub(crate) const DATABASE_URL: &str = "sqlite://tethys.db";
/// Default root directory for torrent payloads.
pub(crate) const DOWNLOAD_ROOT: &str = "downloads";
/// Default status polling cadence in milliseconds.
pub(crate) const POLL_INTERVAL_MS: u64 = 1_000;
/// Shortest accepted polling cadence in milliseconds.
pub(crate) const MIN_POLL_INTERVAL_MS: u64 = 50;
/// Longest accepted polling cadence in milliseconds.
pub(crate) const MAX_POLL_INTERVAL_MS: u64 = 60_000;
/// Default transport notification channel capacity.
pub(crate) const NOTIFICATION_BUFFER: usize = 256;
/// Default log level directive.
pub(crate) const LOG_LEVEL: &str = "info";

/// Environment variable names consulted by the loader.
pub(crate) mod env {
    pub(crate) const DATABASE_URL: &str = "TETHYS_DATABASE_URL";
    pub(crate) const DOWNLOAD_ROOT: &str = "TETHYS_DOWNLOAD_ROOT";
    pub(crate) const POLL_INTERVAL_MS: &str = "TETHYS_POLL_INTERVAL_MS";
    pub(crate) const NOTIFICATION_BUFFER: &str = "TETHYS_NOTIFICATION_BUFFER";
    pub(crate) const LOG_LEVEL: &str = "TETHYS_LOG_LEVEL";
    pub(crate) const LOG_FORMAT: &str = "TETHYS_LOG_FORMAT";
}
