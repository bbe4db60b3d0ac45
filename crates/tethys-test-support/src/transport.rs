//! Scripted [`TransportEngine`] double.
//!
//! Tests drive the notification stream by hand through [`ScriptedTransport::emit`]
//! and inspect the commands the session issued through [`ScriptedTransport::calls`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tethys_torrent_core::{
    AddTorrent, ContentHash, EngineState, FilePriority, RemoveTorrent, SourceDescriptor,
    TorrentError, TorrentHandle, TorrentResult, TransferStats, TransportEngine,
    TransportNotification,
};
use tokio::sync::mpsc;

const NOTIFICATION_BUFFER: usize = 256;

/// Command observed by the scripted transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// `add` was called.
    Add(AddTorrent),
    /// `pause` was called.
    Pause(ContentHash),
    /// `resume` was called.
    Resume(ContentHash),
    /// `remove` was called.
    Remove {
        /// Target torrent.
        content_hash: ContentHash,
        /// Whether payload deletion was requested.
        with_data: bool,
    },
    /// `set_file_priority` was called.
    SetFilePriority {
        /// Target torrent.
        content_hash: ContentHash,
        /// File index.
        index: u32,
        /// Requested priority.
        priority: FilePriority,
    },
    /// `shutdown` was called.
    Shutdown,
}

#[derive(Default)]
struct Script {
    calls: Vec<TransportCall>,
    handles: HashMap<ContentHash, TorrentHandle>,
    statuses: HashMap<ContentHash, TransferStats>,
    failing: HashSet<&'static str>,
}

/// Transport double whose notifications are injected by the test.
pub struct ScriptedTransport {
    sender: mpsc::Sender<TransportNotification>,
    receiver: Mutex<Option<mpsc::Receiver<TransportNotification>>>,
    script: Mutex<Script>,
    running: AtomicBool,
    announce_on_add: bool,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Running transport that stays silent until told to emit.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(NOTIFICATION_BUFFER);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            script: Mutex::new(Script::default()),
            running: AtomicBool::new(true),
            announce_on_add: false,
        }
    }

    /// Transport that emits `StateChanged(DownloadingMetadata)` for each add,
    /// the way a real engine announces a new handle.
    #[must_use]
    pub fn announcing() -> Self {
        Self {
            announce_on_add: true,
            ..Self::new()
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Push a notification onto the stream.
    ///
    /// # Panics
    ///
    /// Panics when the consumer has gone away.
    pub async fn emit(&self, notification: TransportNotification) {
        self.sender
            .send(notification)
            .await
            .expect("notification consumer dropped");
    }

    /// Handle issued for `content_hash`, minting one when none exists yet.
    #[must_use]
    pub fn handle_for(&self, content_hash: &ContentHash) -> TorrentHandle {
        self.script()
            .handles
            .entry(content_hash.clone())
            .or_insert_with(|| TorrentHandle::issue(content_hash.clone()))
            .clone()
    }

    /// Status returned by `poll_status` for `content_hash`.
    pub fn set_status(&self, content_hash: &ContentHash, stats: TransferStats) {
        self.script().statuses.insert(content_hash.clone(), stats);
    }

    /// Make every call to `operation` fail with a transport error.
    pub fn fail(&self, operation: &'static str) {
        self.script().failing.insert(operation);
    }

    /// Let `operation` succeed again.
    pub fn heal(&self, operation: &'static str) {
        self.script().failing.remove(operation);
    }

    /// Commands observed so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.script().calls.clone()
    }

    /// Number of `add` calls observed for `content_hash`.
    #[must_use]
    pub fn add_count(&self, content_hash: &ContentHash) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|call| matches!(call, TransportCall::Add(request) if request.content_hash == *content_hash))
            .count()
    }

    fn record(&self, operation: &'static str, call: TransportCall) -> TorrentResult<()> {
        if !self.is_running() {
            return Err(TorrentError::TransportUnavailable { operation });
        }
        let mut script = self.script();
        script.calls.push(call);
        if script.failing.contains(operation) {
            return Err(TorrentError::transport(operation, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportEngine for ScriptedTransport {
    fn parse_source(&self, source_uri: &str) -> TorrentResult<SourceDescriptor> {
        tethys_transport::source::parse_magnet(source_uri)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn add(&self, request: AddTorrent) -> TorrentResult<()> {
        let content_hash = request.content_hash.clone();
        self.record("add", TransportCall::Add(request))?;
        let handle = self.handle_for(&content_hash);
        if self.announce_on_add {
            self.emit(TransportNotification::StateChanged {
                handle,
                state: EngineState::DownloadingMetadata,
            })
            .await;
        }
        Ok(())
    }

    async fn pause(&self, handle: &TorrentHandle) -> TorrentResult<()> {
        self.record("pause", TransportCall::Pause(handle.content_hash.clone()))
    }

    async fn resume(&self, handle: &TorrentHandle) -> TorrentResult<()> {
        self.record("resume", TransportCall::Resume(handle.content_hash.clone()))
    }

    async fn remove(&self, handle: &TorrentHandle, options: RemoveTorrent) -> TorrentResult<()> {
        self.record(
            "remove",
            TransportCall::Remove {
                content_hash: handle.content_hash.clone(),
                with_data: options.with_data,
            },
        )?;
        self.script().handles.remove(&handle.content_hash);
        Ok(())
    }

    async fn set_file_priority(
        &self,
        handle: &TorrentHandle,
        index: u32,
        priority: FilePriority,
    ) -> TorrentResult<()> {
        self.record(
            "set_file_priority",
            TransportCall::SetFilePriority {
                content_hash: handle.content_hash.clone(),
                index,
                priority,
            },
        )
    }

    async fn poll_status(&self, handle: &TorrentHandle) -> TorrentResult<TransferStats> {
        if !self.is_running() {
            return Err(TorrentError::TransportUnavailable {
                operation: "poll_status",
            });
        }
        let script = self.script();
        if script.failing.contains("poll_status") {
            return Err(TorrentError::transport("poll_status", "scripted failure"));
        }
        Ok(script
            .statuses
            .get(&handle.content_hash)
            .copied()
            .unwrap_or_default())
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<TransportNotification>> {
        self.receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    async fn shutdown(&self) -> TorrentResult<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.script().calls.push(TransportCall::Shutdown);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::sample_hash;

    #[tokio::test]
    async fn add_records_call_and_announces_handle() -> anyhow::Result<()> {
        let transport = ScriptedTransport::announcing();
        let mut notifications = transport.take_notifications().expect("first take");
        assert!(transport.take_notifications().is_none());

        let hash = sample_hash(1);
        transport
            .add(AddTorrent {
                content_hash: hash.clone(),
                source_uri: "magnet:?xt=urn:btih:x".into(),
                save_path: "/tmp".into(),
                sequential: false,
            })
            .await?;

        let announced = notifications.recv().await.expect("announcement");
        assert_eq!(announced.handle(), &transport.handle_for(&hash));
        assert_eq!(transport.add_count(&hash), 1);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_rejects_later_commands() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new();
        let handle = transport.handle_for(&sample_hash(2));
        transport.shutdown().await?;
        transport.shutdown().await?;

        let err = transport.pause(&handle).await.expect_err("stopped");
        assert!(matches!(err, TorrentError::TransportUnavailable { .. }));
        assert_eq!(transport.calls(), vec![TransportCall::Shutdown]);
        Ok(())
    }

    #[tokio::test]
    async fn scripted_failures_can_be_healed() -> anyhow::Result<()> {
        let transport = ScriptedTransport::new();
        let handle = transport.handle_for(&sample_hash(3));
        transport.fail("poll_status");
        assert!(transport.poll_status(&handle).await.is_err());
        transport.heal("poll_status");
        assert_eq!(transport.poll_status(&handle).await?, TransferStats::default());
        Ok(())
    }
}
