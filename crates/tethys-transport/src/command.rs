use tethys_torrent_core::{
    AddTorrent, FilePriority, RemoveTorrent, TorrentHandle, TorrentResult, TransferStats,
};
use tokio::sync::oneshot;

/// Commands processed by the session worker.
#[derive(Debug)]
pub(crate) enum EngineCommand {
    Add(Box<AddTorrent>),
    Pause {
        handle: TorrentHandle,
    },
    Resume {
        handle: TorrentHandle,
    },
    Remove {
        handle: TorrentHandle,
        options: RemoveTorrent,
    },
    SetFilePriority {
        handle: TorrentHandle,
        index: u32,
        priority: FilePriority,
    },
    QueryStatus {
        handle: TorrentHandle,
        respond_to: oneshot::Sender<TorrentResult<TransferStats>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

impl EngineCommand {
    /// Handle targeted by the command, when it has one.
    pub(crate) const fn handle(&self) -> Option<&TorrentHandle> {
        match self {
            Self::Pause { handle }
            | Self::Resume { handle }
            | Self::Remove { handle, .. }
            | Self::SetFilePriority { handle, .. }
            | Self::QueryStatus { handle, .. } => Some(handle),
            Self::Add(_) | Self::Shutdown { .. } => None,
        }
    }
}
