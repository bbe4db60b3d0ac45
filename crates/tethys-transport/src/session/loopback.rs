use std::collections::HashMap;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tethys_torrent_core::{
    AddTorrent, ContentHash, EngineState, FilePriority, RemoveTorrent, TorrentHandle,
    TorrentMetadata, TransferStats, TransportNotification,
};

use super::TransportSession;

const DEFAULT_BYTES_PER_TICK: u64 = 1024 * 1024;

/// In-memory session that simulates transfers without touching the network.
///
/// Metadata resolves only for hashes present in the catalogue; every alert
/// tick then moves `bytes_per_tick` of selected payload until the torrent
/// finishes and starts seeding.
pub struct LoopbackSession {
    catalog: HashMap<ContentHash, TorrentMetadata>,
    torrents: HashMap<ContentHash, LoopbackTorrent>,
    pending_events: Vec<TransportNotification>,
    bytes_per_tick: u64,
}

struct LoopbackTorrent {
    handle: TorrentHandle,
    metadata: Option<TorrentMetadata>,
    priorities: Vec<FilePriority>,
    downloaded: u64,
    uploaded: u64,
    paused: bool,
    finished: bool,
    transferring: bool,
}

impl LoopbackTorrent {
    fn selected_size(&self) -> u64 {
        self.metadata.as_ref().map_or(0, |metadata| {
            metadata
                .files
                .iter()
                .zip(&self.priorities)
                .filter(|(_, priority)| priority.is_selected())
                .map(|(file, _)| file.size_bytes)
                .sum()
        })
    }

    fn engine_state(&self) -> EngineState {
        if self.paused {
            EngineState::Paused
        } else if self.metadata.is_none() {
            EngineState::DownloadingMetadata
        } else if self.finished {
            EngineState::Seeding
        } else {
            EngineState::Downloading
        }
    }
}

impl Default for LoopbackSession {
    fn default() -> Self {
        Self::new(DEFAULT_BYTES_PER_TICK)
    }
}

impl LoopbackSession {
    /// Session advancing `bytes_per_tick` per alert tick.
    #[must_use]
    pub fn new(bytes_per_tick: u64) -> Self {
        Self {
            catalog: HashMap::new(),
            torrents: HashMap::new(),
            pending_events: Vec::new(),
            bytes_per_tick: bytes_per_tick.max(1),
        }
    }

    /// Preload metadata that resolves once the matching hash is added.
    #[must_use]
    pub fn with_catalog(
        mut self,
        entries: impl IntoIterator<Item = (ContentHash, TorrentMetadata)>,
    ) -> Self {
        self.catalog.extend(entries);
        self
    }

    fn torrent_mut(&mut self, handle: &TorrentHandle) -> Result<&mut LoopbackTorrent> {
        self.torrents
            .get_mut(&handle.content_hash)
            .filter(|torrent| torrent.handle == *handle)
            .ok_or_else(|| anyhow!("unknown torrent {}", handle.content_hash))
    }

    fn push_state(&mut self, handle: TorrentHandle, state: EngineState) {
        self.pending_events
            .push(TransportNotification::StateChanged { handle, state });
    }

    fn advance(&mut self) {
        let mut events = Vec::new();
        for torrent in self.torrents.values_mut() {
            torrent.transferring = false;
            if torrent.paused {
                continue;
            }

            if torrent.metadata.is_none() {
                if let Some(metadata) = self.catalog.get(&torrent.handle.content_hash) {
                    torrent.priorities = vec![FilePriority::Normal; metadata.files.len()];
                    torrent.metadata = Some(metadata.clone());
                    events.push(TransportNotification::MetadataReceived {
                        handle: torrent.handle.clone(),
                        metadata: metadata.clone(),
                    });
                    events.push(TransportNotification::StateChanged {
                        handle: torrent.handle.clone(),
                        state: EngineState::Downloading,
                    });
                }
                continue;
            }

            if torrent.finished {
                continue;
            }

            let target = torrent.selected_size();
            torrent.downloaded = torrent
                .downloaded
                .saturating_add(self.bytes_per_tick)
                .min(target);
            torrent.transferring = true;
            if torrent.downloaded >= target {
                torrent.finished = true;
                events.push(TransportNotification::TorrentFinished {
                    handle: torrent.handle.clone(),
                });
                events.push(TransportNotification::StateChanged {
                    handle: torrent.handle.clone(),
                    state: EngineState::Seeding,
                });
            }
        }
        self.pending_events.extend(events);
    }
}

#[async_trait]
impl TransportSession for LoopbackSession {
    async fn add_torrent(&mut self, request: &AddTorrent) -> Result<TorrentHandle> {
        if let Some(existing) = self.torrents.get(&request.content_hash) {
            let handle = existing.handle.clone();
            let state = existing.engine_state();
            self.push_state(handle.clone(), state);
            return Ok(handle);
        }

        let handle = TorrentHandle::issue(request.content_hash.clone());
        self.torrents.insert(
            request.content_hash.clone(),
            LoopbackTorrent {
                handle: handle.clone(),
                metadata: None,
                priorities: Vec::new(),
                downloaded: 0,
                uploaded: 0,
                paused: false,
                finished: false,
                transferring: false,
            },
        );
        self.push_state(handle.clone(), EngineState::DownloadingMetadata);
        Ok(handle)
    }

    async fn pause(&mut self, handle: &TorrentHandle) -> Result<()> {
        self.torrent_mut(handle)?.paused = true;
        self.push_state(handle.clone(), EngineState::Paused);
        Ok(())
    }

    async fn resume(&mut self, handle: &TorrentHandle) -> Result<()> {
        let torrent = self.torrent_mut(handle)?;
        torrent.paused = false;
        let state = torrent.engine_state();
        self.push_state(handle.clone(), state);
        Ok(())
    }

    async fn remove(&mut self, handle: &TorrentHandle, _options: RemoveTorrent) -> Result<()> {
        self.torrent_mut(handle)?;
        self.torrents.remove(&handle.content_hash);
        Ok(())
    }

    async fn set_file_priority(
        &mut self,
        handle: &TorrentHandle,
        index: u32,
        priority: FilePriority,
    ) -> Result<()> {
        let torrent = self.torrent_mut(handle)?;
        if torrent.metadata.is_none() {
            bail!("metadata not yet available for {}", handle.content_hash);
        }
        let slot = usize::try_from(index)
            .ok()
            .and_then(|index| torrent.priorities.get_mut(index))
            .ok_or_else(|| anyhow!("file index {index} out of range"))?;
        *slot = priority;
        Ok(())
    }

    async fn status(&mut self, handle: &TorrentHandle) -> Result<TransferStats> {
        let bytes_per_tick = self.bytes_per_tick;
        let torrent = self.torrent_mut(handle)?;
        let target = torrent.selected_size();
        let progress = if target == 0 {
            if torrent.finished { 1.0 } else { 0.0 }
        } else {
            ratio(torrent.downloaded, target)
        };
        Ok(TransferStats {
            progress,
            downloaded_size: torrent.downloaded,
            uploaded_size: torrent.uploaded,
            download_rate: if torrent.transferring { bytes_per_tick } else { 0 },
            upload_rate: 0,
            num_peers: u32::from(torrent.transferring),
            num_seeds: u32::from(torrent.transferring),
        })
    }

    async fn poll_events(&mut self) -> Result<Vec<TransportNotification>> {
        self.advance();
        Ok(std::mem::take(&mut self.pending_events))
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.torrents.clear();
        self.pending_events.clear();
        Ok(())
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    #[expect(
        clippy::cast_precision_loss,
        reason = "simulated progress is a display ratio"
    )]
    {
        (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
    }
}
