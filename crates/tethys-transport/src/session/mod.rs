//! Engine session abstraction driven by the background worker.

mod loopback;

pub use loopback::LoopbackSession;

use anyhow::Result;
use async_trait::async_trait;
use tethys_torrent_core::{
    AddTorrent, FilePriority, RemoveTorrent, TorrentHandle, TransferStats, TransportNotification,
};

/// Operations a concrete BitTorrent session must provide.
///
/// The worker owns the session exclusively, so methods take `&mut self`.
#[async_trait]
pub trait TransportSession: Send {
    /// Admit a torrent and return the handle it will be reported under.
    async fn add_torrent(&mut self, request: &AddTorrent) -> Result<TorrentHandle>;

    /// Pause transfer.
    async fn pause(&mut self, handle: &TorrentHandle) -> Result<()>;

    /// Resume transfer.
    async fn resume(&mut self, handle: &TorrentHandle) -> Result<()>;

    /// Drop the torrent from the session.
    async fn remove(&mut self, handle: &TorrentHandle, options: RemoveTorrent) -> Result<()>;

    /// Change one file's priority.
    async fn set_file_priority(
        &mut self,
        handle: &TorrentHandle,
        index: u32,
        priority: FilePriority,
    ) -> Result<()>;

    /// Point-in-time transfer counters.
    async fn status(&mut self, handle: &TorrentHandle) -> Result<TransferStats>;

    /// Drain notifications produced since the last call.
    async fn poll_events(&mut self) -> Result<Vec<TransportNotification>>;

    /// Release session resources.
    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
