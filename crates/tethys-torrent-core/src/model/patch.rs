//! Partial record updates.
//!
//! Two independent writers touch every record: the event dispatcher (state and
//! metadata) and the stats poller (transfer counters). Both write through
//! [`TorrentPatch`], which names only the fields a writer owns, so the store can
//! merge per field instead of replacing whole records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FileRecord, TorrentRecord, TorrentState};

/// Point-in-time transfer counters pulled from a live handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Fraction complete in `0.0..=1.0`.
    pub progress: f64,
    pub downloaded_size: u64,
    pub uploaded_size: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
}

/// Field-level update to a persisted record. `None` leaves a field untouched.
///
/// Fields that are themselves optional on the record use a nested `Option`:
/// `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentPatch {
    pub state: Option<TorrentState>,
    pub display_name: Option<String>,
    pub total_size: Option<u64>,
    pub files: Option<Vec<FileRecord>>,
    pub last_error: Option<Option<String>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub sequential_download: Option<bool>,
    pub is_private: Option<bool>,
    pub creator: Option<Option<String>>,
    pub comment: Option<Option<String>>,
    pub trackers: Option<Vec<String>>,
    pub progress: Option<f64>,
    pub downloaded_size: Option<u64>,
    pub uploaded_size: Option<u64>,
    pub download_rate: Option<u64>,
    pub upload_rate: Option<u64>,
    pub num_peers: Option<u32>,
    pub num_seeds: Option<u32>,
}

impl TorrentPatch {
    /// Patch that only moves the state.
    #[must_use]
    pub fn state(state: TorrentState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Patch carrying the transfer counters of a poll snapshot and nothing else.
    #[must_use]
    pub fn from_stats(stats: &TransferStats) -> Self {
        Self {
            progress: Some(stats.progress.clamp(0.0, 1.0)),
            downloaded_size: Some(stats.downloaded_size),
            uploaded_size: Some(stats.uploaded_size),
            download_rate: Some(stats.download_rate),
            upload_rate: Some(stats.upload_rate),
            num_peers: Some(stats.num_peers),
            num_seeds: Some(stats.num_seeds),
            ..Self::default()
        }
    }

    /// Also clear any recorded error.
    #[must_use]
    pub fn clearing_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether the patch writes any of the poller-owned transfer counters.
    #[must_use]
    pub const fn touches_transfer(&self) -> bool {
        self.progress.is_some()
            || self.downloaded_size.is_some()
            || self.uploaded_size.is_some()
            || self.download_rate.is_some()
            || self.upload_rate.is_some()
            || self.num_peers.is_some()
            || self.num_seeds.is_some()
    }

    /// Merge the patch into an in-memory record.
    pub fn apply_to(&self, record: &mut TorrentRecord) {
        if let Some(state) = self.state {
            record.state = state;
        }
        if let Some(name) = &self.display_name {
            record.display_name.clone_from(name);
        }
        if let Some(total_size) = self.total_size {
            record.total_size = total_size;
        }
        if let Some(files) = &self.files {
            record.files.clone_from(files);
        }
        if let Some(last_error) = &self.last_error {
            record.last_error.clone_from(last_error);
        }
        if let Some(finished_at) = self.finished_at {
            record.finished_at = finished_at;
        }
        if let Some(sequential) = self.sequential_download {
            record.sequential_download = sequential;
        }
        if let Some(is_private) = self.is_private {
            record.is_private = is_private;
        }
        if let Some(creator) = &self.creator {
            record.creator.clone_from(creator);
        }
        if let Some(comment) = &self.comment {
            record.comment.clone_from(comment);
        }
        if let Some(trackers) = &self.trackers {
            record.trackers.clone_from(trackers);
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(value) = self.downloaded_size {
            record.downloaded_size = value;
        }
        if let Some(value) = self.uploaded_size {
            record.uploaded_size = value;
        }
        if let Some(value) = self.download_rate {
            record.download_rate = value;
        }
        if let Some(value) = self.upload_rate {
            record.upload_rate = value;
        }
        if let Some(value) = self.num_peers {
            record.num_peers = value;
        }
        if let Some(value) = self.num_seeds {
            record.num_seeds = value;
        }
    }
}
