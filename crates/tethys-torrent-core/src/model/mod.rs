//! Core torrent domain types shared across the workspace.

mod notification;
mod patch;
mod stats;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
pub use tethys_events::TorrentState;

pub use notification::{
    EngineState, MetadataFile, TorrentHandle, TorrentMetadata, TransportNotification,
};
pub use patch::{TorrentPatch, TransferStats};
pub use stats::TorrentStats;

/// Display name used until metadata supplies the real one.
pub const PLACEHOLDER_NAME: &str = "Loading...";

/// Extensions treated as playable video payloads.
const VIDEO_EXTENSIONS: [&str; 11] = [
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpg", "mpeg", "3gp",
];

/// Unique torrent identity: the lowercase hex form of the info-hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of a SHA-1 info-hash rendered as hex.
    pub const HEX_LEN: usize = 40;

    /// Accept a 40 character hex digest in either case.
    #[must_use]
    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() == Self::HEX_LEN && value.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            Some(Self(value.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// Render raw digest bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; 20]) -> Self {
        use fmt::Write as _;

        let mut hex = String::with_capacity(Self::HEX_LEN);
        for byte in bytes {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Borrow the hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_hex(value).ok_or("content hash must be 40 hexadecimal characters")
    }
}

/// File download priority. Discriminants are the transport's priority levels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(into = "u8", from = "u8")]
#[repr(u8)]
pub enum FilePriority {
    /// Skip the file entirely.
    DontDownload = 0,
    /// Fetch only when nothing else is pending.
    Low = 1,
    /// Default priority.
    #[default]
    Normal = 4,
    /// Prefer over normal files.
    High = 6,
    /// Fetch first.
    Maximum = 7,
}

impl FilePriority {
    /// Numeric level understood by the transport engine.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    /// Map a transport level back to a priority; unknown levels fall back to `Normal`.
    #[must_use]
    pub const fn from_level(level: u8) -> Self {
        match level {
            0 => Self::DontDownload,
            1 => Self::Low,
            6 => Self::High,
            7 => Self::Maximum,
            _ => Self::Normal,
        }
    }

    /// Whether the file takes part in the download at all.
    #[must_use]
    pub fn is_selected(self) -> bool {
        self > Self::DontDownload
    }
}

impl From<FilePriority> for u8 {
    fn from(priority: FilePriority) -> Self {
        priority.level()
    }
}

impl From<u8> for FilePriority {
    fn from(level: u8) -> Self {
        Self::from_level(level)
    }
}

/// Per-file priority change addressed by file index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePriorityOverride {
    /// Index within the torrent's file list.
    pub index: u32,
    /// Priority to apply.
    pub priority: FilePriority,
}

/// One file inside a torrent, in transport file order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Position in the transport's file ordering; unique within a record.
    pub index: u32,
    /// Path relative to the torrent's save path.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Bytes already on disk.
    #[serde(default)]
    pub downloaded_bytes: u64,
    /// Requested download priority.
    #[serde(default)]
    pub priority: FilePriority,
}

impl FileRecord {
    /// Final path component.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit(['/', '\\']).next().unwrap_or(&self.path)
    }

    /// Lowercase extension of the file name, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        let name = self.name();
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Whether the file looks like a playable video.
    #[must_use]
    pub fn is_video(&self) -> bool {
        self.extension()
            .is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
    }

    /// Whether the file takes part in the download.
    #[must_use]
    pub fn is_selected(&self) -> bool {
        self.priority.is_selected()
    }

    /// Fraction of the file already downloaded, in `0.0..=1.0`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        ratio(self.downloaded_bytes, self.size_bytes)
    }
}

/// Durable view of one torrent, keyed by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub content_hash: ContentHash,
    pub source_uri: String,
    pub display_name: String,
    pub save_path: String,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub uploaded_size: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    /// Fraction complete as last reported by the transport.
    pub progress: f64,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub state: TorrentState,
    pub files: Vec<FileRecord>,
    pub added_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub sequential_download: bool,
    pub is_private: bool,
    pub creator: Option<String>,
    pub comment: Option<String>,
    pub trackers: Vec<String>,
}

impl TorrentRecord {
    /// Fresh record for a newly admitted source, awaiting metadata.
    #[must_use]
    pub fn new(
        content_hash: ContentHash,
        source_uri: impl Into<String>,
        display_name: Option<String>,
        save_path: impl Into<String>,
    ) -> Self {
        Self {
            content_hash,
            source_uri: source_uri.into(),
            display_name: display_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| PLACEHOLDER_NAME.to_string()),
            save_path: save_path.into(),
            total_size: 0,
            downloaded_size: 0,
            uploaded_size: 0,
            download_rate: 0,
            upload_rate: 0,
            progress: 0.0,
            num_peers: 0,
            num_seeds: 0,
            state: TorrentState::MetadataDownloading,
            files: Vec::new(),
            added_at: Utc::now(),
            finished_at: None,
            last_error: None,
            sequential_download: false,
            is_private: false,
            creator: None,
            comment: None,
            trackers: Vec::new(),
        }
    }

    /// Whether the record is in the active state set.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether the record is parked in the error state.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.state == TorrentState::Error || self.last_error.is_some()
    }

    /// Whether metadata has been learned for this torrent.
    #[must_use]
    pub fn has_metadata(&self) -> bool {
        !self.files.is_empty()
    }

    /// Total bytes across files that are not skipped.
    #[must_use]
    pub fn selected_size(&self) -> u64 {
        self.files
            .iter()
            .filter(|file| file.is_selected())
            .map(|file| file.size_bytes)
            .sum()
    }

    /// Number of files that are not skipped.
    #[must_use]
    pub fn selected_file_count(&self) -> usize {
        self.files.iter().filter(|file| file.is_selected()).count()
    }

    /// Completion derived from byte counters, independent of the reported value.
    #[must_use]
    pub fn computed_progress(&self) -> f64 {
        ratio(self.downloaded_size, self.total_size)
    }

    /// Seconds remaining at the current download rate; `None` when stalled.
    #[must_use]
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.download_rate == 0 {
            return None;
        }
        let remaining = self.total_size.saturating_sub(self.downloaded_size);
        Some(remaining.div_ceil(self.download_rate))
    }

    /// Uploaded over downloaded bytes; zero before anything was downloaded.
    #[must_use]
    pub fn share_ratio(&self) -> f64 {
        if self.downloaded_size == 0 {
            0.0
        } else {
            to_f64(self.uploaded_size) / to_f64(self.downloaded_size)
        }
    }

    /// Look up a file by its transport index.
    #[must_use]
    pub fn file(&self, index: u32) -> Option<&FileRecord> {
        self.files.iter().find(|file| file.index == index)
    }
}

/// Parsed form of a source URI, produced by the transport engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Identity derived from the source.
    pub content_hash: ContentHash,
    /// Display name hint carried by the source, if any.
    pub display_name: Option<String>,
    /// Tracker URLs carried by the source.
    pub trackers: Vec<String>,
}

/// Request payload for admitting a torrent into the transport engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddTorrent {
    /// Identity the engine should report back in notifications.
    pub content_hash: ContentHash,
    /// Source URI to resolve.
    pub source_uri: String,
    /// Directory the payload is written to.
    pub save_path: String,
    /// Whether pieces should be fetched in order.
    #[serde(default)]
    pub sequential: bool,
}

/// Options applied when removing a torrent from the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveTorrent {
    /// Whether downloaded payload should be deleted as well.
    #[serde(default)]
    pub with_data: bool,
}

pub(crate) fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        (to_f64(numerator) / to_f64(denominator)).clamp(0.0, 1.0)
    }
}

pub(crate) const fn to_f64(value: u64) -> f64 {
    #[expect(
        clippy::cast_precision_loss,
        reason = "u64 to f64 conversion is required for user-facing ratio reporting"
    )]
    {
        value as f64
    }
}
