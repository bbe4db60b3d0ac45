//! Collaborator traits the session engine is wired against.
//!
//! The transport engine and the durable store are external systems; the session
//! engine only ever sees them through these traits so the production adapters
//! and the test doubles are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::{TorrentError, TorrentResult};
use crate::model::{
    ContentHash, FilePriority, FilePriorityOverride, RemoveTorrent, SourceDescriptor,
    TorrentHandle, TorrentPatch, TorrentRecord, TorrentState, TorrentStats, TransferStats,
    TransportNotification,
};

/// Full record set as of one committed store write.
pub type TorrentSnapshot = Arc<Vec<TorrentRecord>>;

/// BitTorrent transport engine boundary.
#[async_trait]
pub trait TransportEngine: Send + Sync {
    /// Parse a source URI into its content hash and descriptive hints.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::InvalidSource`] when the URI is malformed.
    fn parse_source(&self, source_uri: &str) -> TorrentResult<SourceDescriptor>;

    /// Whether the engine session accepts commands.
    fn is_running(&self) -> bool;

    /// Admit a torrent; its handle arrives later on the notification stream.
    async fn add(&self, request: crate::model::AddTorrent) -> TorrentResult<()>;

    /// Pause transfer for a live handle.
    async fn pause(&self, handle: &TorrentHandle) -> TorrentResult<()>;

    /// Resume transfer for a live handle.
    async fn resume(&self, handle: &TorrentHandle) -> TorrentResult<()>;

    /// Drop a handle from the engine, optionally deleting its payload.
    async fn remove(&self, handle: &TorrentHandle, options: RemoveTorrent) -> TorrentResult<()>;

    /// Change one file's priority; default implementation reports lack of support.
    async fn set_file_priority(
        &self,
        handle: &TorrentHandle,
        index: u32,
        priority: FilePriority,
    ) -> TorrentResult<()> {
        let _ = (handle, index, priority);
        Err(TorrentError::Unsupported {
            operation: "set_file_priority",
        })
    }

    /// Pull a point-in-time transfer snapshot for a live handle.
    async fn poll_status(&self, handle: &TorrentHandle) -> TorrentResult<TransferStats>;

    /// Hand out the notification stream. There is exactly one consumer, so
    /// every call after the first returns `None`.
    fn take_notifications(&self) -> Option<mpsc::Receiver<TransportNotification>>;

    /// Stop the engine session and release its resources. Safe to repeat.
    async fn shutdown(&self) -> TorrentResult<()>;
}

/// Durable, keyed record storage with a change feed.
#[async_trait]
pub trait TorrentStore: Send + Sync {
    /// Insert or fully replace a record.
    async fn upsert(&self, record: &TorrentRecord) -> TorrentResult<()>;

    /// Point lookup by content hash.
    async fn get(&self, content_hash: &ContentHash) -> TorrentResult<Option<TorrentRecord>>;

    /// Every record, newest first.
    async fn list_all(&self) -> TorrentResult<Vec<TorrentRecord>>;

    /// Records whose state is in `states`, newest first.
    async fn list_where(&self, states: &[TorrentState]) -> TorrentResult<Vec<TorrentRecord>>;

    /// Merge a partial update into an existing record. Returns `false` when no
    /// record exists; never inserts.
    async fn update_fields(
        &self,
        content_hash: &ContentHash,
        patch: &TorrentPatch,
    ) -> TorrentResult<bool>;

    /// Rewrite the priority of the addressed files only. Returns `false` when no
    /// record exists. Unknown file indices are ignored.
    async fn set_file_priorities(
        &self,
        content_hash: &ContentHash,
        changes: &[FilePriorityOverride],
    ) -> TorrentResult<bool>;

    /// Delete a record. Returns whether anything was deleted.
    async fn delete(&self, content_hash: &ContentHash) -> TorrentResult<bool>;

    /// Number of persisted records.
    async fn count(&self) -> TorrentResult<usize> {
        Ok(self.list_all().await?.len())
    }

    /// Subscribe to full-snapshot change notifications.
    fn subscribe_all(&self) -> watch::Receiver<TorrentSnapshot>;
}

/// Instruction keeping the hosting process alive while torrents are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveSignal {
    /// At least one record entered the active set.
    Start {
        /// Active records at the time of the transition.
        active: usize,
    },
    /// The active set became empty.
    Stop,
}

/// Presentation-side receiver of keepalive instructions.
pub trait KeepaliveSink: Send + Sync {
    /// Deliver a keepalive transition.
    fn signal(&self, signal: KeepaliveSignal);
}

/// Control surface exposed to the presentation bridge.
#[async_trait]
pub trait TorrentWorkflow: Send + Sync {
    /// Admit a source URI, returning its content hash.
    async fn add_torrent(&self, source_uri: &str, save_path: &str) -> TorrentResult<ContentHash>;

    /// Pause a torrent; unknown hashes are a logged no-op.
    async fn pause_torrent(&self, content_hash: &ContentHash) -> TorrentResult<()>;

    /// Resume a torrent; unknown hashes are a logged no-op.
    async fn resume_torrent(&self, content_hash: &ContentHash) -> TorrentResult<()>;

    /// Remove a torrent and optionally its payload; unknown hashes succeed.
    async fn remove_torrent(
        &self,
        content_hash: &ContentHash,
        options: RemoveTorrent,
    ) -> TorrentResult<()>;

    /// Change the priority of several files at once.
    async fn set_file_priorities(
        &self,
        content_hash: &ContentHash,
        changes: &[FilePriorityOverride],
    ) -> TorrentResult<()>;

    /// Change the priority of a single file.
    async fn set_file_priority(
        &self,
        content_hash: &ContentHash,
        index: u32,
        priority: FilePriority,
    ) -> TorrentResult<()> {
        self.set_file_priorities(content_hash, &[FilePriorityOverride { index, priority }])
            .await
    }
}

/// Read surface exposed to the presentation bridge.
#[async_trait]
pub trait TorrentInspector: Send + Sync {
    /// Fetch one record.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::NotFound`] for unknown hashes.
    async fn get_torrent(&self, content_hash: &ContentHash) -> TorrentResult<TorrentRecord>;

    /// Every record, newest first.
    async fn list_torrents(&self) -> TorrentResult<Vec<TorrentRecord>>;

    /// Aggregate counters over the catalogue.
    async fn stats(&self) -> TorrentResult<TorrentStats> {
        Ok(TorrentStats::from_records(&self.list_torrents().await?))
    }

    /// Push subscription of the full record list.
    fn subscribe_torrents(&self) -> watch::Receiver<TorrentSnapshot>;
}
