//! Asynchronous notifications emitted by the transport engine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ContentHash;

/// Opaque token for one torrent inside a running transport session.
///
/// Handles are issued by the engine and first observed on a notification; they
/// never outlive the engine session that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TorrentHandle {
    /// Identity the handle belongs to.
    pub content_hash: ContentHash,
    /// Engine-side session identifier.
    pub session_id: Uuid,
}

impl TorrentHandle {
    /// Issue a handle with a fresh session identifier.
    #[must_use]
    pub fn issue(content_hash: ContentHash) -> Self {
        Self {
            content_hash,
            session_id: Uuid::new_v4(),
        }
    }

    /// Placeholder for a torrent the engine refused to admit. It names the
    /// content hash only and never refers to an engine-side session.
    #[must_use]
    pub const fn unassigned(content_hash: ContentHash) -> Self {
        Self {
            content_hash,
            session_id: Uuid::nil(),
        }
    }

    /// Whether the engine actually issued this handle.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        !self.session_id.is_nil()
    }
}

/// Raw engine-side torrent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    CheckingFiles,
    CheckingResumeData,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    Allocating,
    Paused,
}

/// One file entry of resolved metadata, in engine order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFile {
    /// Path relative to the save directory.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
}

/// Torrent metadata resolved by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentMetadata {
    pub name: String,
    pub files: Vec<MetadataFile>,
    pub is_private: bool,
    pub creator: Option<String>,
    pub comment: Option<String>,
    pub trackers: Vec<String>,
}

impl TorrentMetadata {
    /// Sum of all file sizes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|file| file.size_bytes).sum()
    }
}

/// Closed set of notifications the engine reports, each tagged by handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportNotification {
    /// Metadata was resolved.
    MetadataReceived {
        /// Handle the metadata belongs to.
        handle: TorrentHandle,
        /// Resolved metadata.
        metadata: TorrentMetadata,
    },
    /// The engine moved the torrent to a new state.
    StateChanged {
        /// Handle whose state changed.
        handle: TorrentHandle,
        /// New engine state.
        state: EngineState,
    },
    /// Every selected piece is on disk.
    TorrentFinished {
        /// Handle that finished.
        handle: TorrentHandle,
    },
    /// The engine hit a runtime failure for the torrent.
    TorrentError {
        /// Handle that failed.
        handle: TorrentHandle,
        /// Engine-provided failure description.
        message: String,
    },
}

impl TransportNotification {
    /// Handle the notification is tagged with.
    #[must_use]
    pub const fn handle(&self) -> &TorrentHandle {
        match self {
            Self::MetadataReceived { handle, .. }
            | Self::StateChanged { handle, .. }
            | Self::TorrentFinished { handle }
            | Self::TorrentError { handle, .. } => handle,
        }
    }

    /// Content hash of the tagged handle.
    #[must_use]
    pub const fn content_hash(&self) -> &ContentHash {
        &self.handle().content_hash
    }

    /// Machine-friendly discriminator for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MetadataReceived { .. } => "metadata_received",
            Self::StateChanged { .. } => "state_changed",
            Self::TorrentFinished { .. } => "torrent_finished",
            Self::TorrentError { .. } => "torrent_error",
        }
    }
}
