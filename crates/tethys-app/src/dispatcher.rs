//! Single consumer of the transport notification stream.
//!
//! # Design
//! - Notifications are applied strictly in arrival order; a notification whose
//!   store write failed is parked in a bounded backlog, and later notifications
//!   for the same hash queue behind it. The backlog filling or draining is
//!   published as a health change.
//! - [`reconcile`] is the pure state machine: it turns a record and a
//!   notification into a partial update that never touches poller-owned fields.
//! - A notification for a hash with no record is stale and is dropped. A
//!   handle no registry slot owns is dropped too and reaped once on the engine.
//! - A rejection reported under an unassigned handle records the error and
//!   releases the pending slot, so a later resume admits the torrent again.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tethys_events::{DiscoveredFile, Event, EventBus};
use tethys_telemetry::Metrics;
use tethys_torrent_core::{
    ContentHash, EngineState, FilePriority, FileRecord, RemoveTorrent, TorrentHandle,
    TorrentMetadata, TorrentPatch, TorrentRecord, TorrentResult, TorrentState, TorrentStore,
    TransportEngine, TransportNotification,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{AttachOutcome, HandleRegistry};

/// Map an engine-reported state onto the persisted state machine.
pub(crate) const fn map_engine_state(state: EngineState) -> TorrentState {
    match state {
        EngineState::DownloadingMetadata => TorrentState::MetadataDownloading,
        EngineState::CheckingFiles | EngineState::CheckingResumeData => TorrentState::Checking,
        EngineState::Downloading => TorrentState::Downloading,
        EngineState::Finished | EngineState::Seeding => TorrentState::Seeding,
        EngineState::Allocating | EngineState::Paused => TorrentState::Stopped,
    }
}

/// Partial update produced by applying `notification` to `record`.
///
/// Only `state`, `files`, `display_name`, `total_size`, `last_error`,
/// `finished_at` and the descriptive metadata fields are ever set.
pub(crate) fn reconcile(record: &TorrentRecord, notification: &TransportNotification) -> TorrentPatch {
    match notification {
        TransportNotification::MetadataReceived { metadata, .. } => {
            metadata_patch(record, metadata)
        }
        TransportNotification::StateChanged { state, .. } => {
            TorrentPatch::state(map_engine_state(*state)).clearing_error()
        }
        TransportNotification::TorrentFinished { .. } => {
            let mut patch = TorrentPatch::state(TorrentState::Finished).clearing_error();
            if record.finished_at.is_none() {
                patch.finished_at = Some(Some(Utc::now()));
            }
            patch
        }
        TransportNotification::TorrentError { message, .. } => TorrentPatch {
            last_error: Some(Some(message.clone())),
            ..TorrentPatch::state(TorrentState::Error)
        },
    }
}

fn metadata_patch(record: &TorrentRecord, metadata: &TorrentMetadata) -> TorrentPatch {
    let files = metadata
        .files
        .iter()
        .enumerate()
        .filter_map(|(position, file)| {
            let index = u32::try_from(position).ok()?;
            let priority = record
                .file(index)
                .map_or(FilePriority::Normal, |known| known.priority);
            Some(FileRecord {
                index,
                path: file.path.clone(),
                size_bytes: file.size_bytes,
                downloaded_bytes: 0,
                priority,
            })
        })
        .collect();
    let name = metadata.name.trim();

    TorrentPatch {
        display_name: (!name.is_empty()).then(|| name.to_string()),
        total_size: Some(metadata.total_size()),
        files: Some(files),
        is_private: Some(metadata.is_private),
        creator: Some(metadata.creator.clone()),
        comment: Some(metadata.comment.clone()),
        trackers: (!metadata.trackers.is_empty()).then(|| metadata.trackers.clone()),
        ..TorrentPatch::state(TorrentState::Downloading).clearing_error()
    }
}

/// Notifications waiting for their store write to be retried.
#[derive(Debug)]
struct RetryBacklog {
    entries: VecDeque<TransportNotification>,
    capacity: usize,
}

impl RetryBacklog {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn holds(&self, content_hash: &ContentHash) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.content_hash() == content_hash)
    }

    fn push(&mut self, notification: TransportNotification) {
        if self.entries.len() >= self.capacity
            && let Some(dropped) = self.entries.pop_front()
        {
            warn!(
                content_hash = %dropped.content_hash(),
                kind = dropped.kind(),
                capacity = self.capacity,
                "retry backlog full; dropping oldest notification"
            );
        }
        self.entries.push_back(notification);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) struct EventDispatcher {
    store: Arc<dyn TorrentStore>,
    transport: Arc<dyn TransportEngine>,
    registry: Arc<HandleRegistry>,
    events: EventBus,
    metrics: Metrics,
    backlog: RetryBacklog,
    reaped: HashSet<Uuid>,
    retry_interval: Duration,
}

impl EventDispatcher {
    pub(crate) fn new(
        store: Arc<dyn TorrentStore>,
        transport: Arc<dyn TransportEngine>,
        registry: Arc<HandleRegistry>,
        events: EventBus,
        metrics: Metrics,
        retry_interval: Duration,
        retry_capacity: usize,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
            events,
            metrics,
            backlog: RetryBacklog::new(retry_capacity),
            reaped: HashSet::new(),
            retry_interval,
        }
    }

    pub(crate) fn spawn(
        mut self,
        mut notifications: mpsc::Receiver<TransportNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut retry = tokio::time::interval(self.retry_interval);
            retry.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    received = notifications.recv() => {
                        let Some(notification) = received else {
                            info!("transport notification stream closed");
                            break;
                        };
                        self.handle(notification).await;
                    }
                    _ = retry.tick(), if !self.backlog.is_empty() => self.retry_backlog().await,
                }
            }
            debug!(pending = self.backlog.len(), "event dispatcher stopped");
        })
    }

    async fn handle(&mut self, notification: TransportNotification) {
        self.metrics.inc_notification(notification.kind());
        if self.backlog.holds(notification.content_hash()) {
            debug!(
                content_hash = %notification.content_hash(),
                "queueing notification behind pending retry"
            );
            self.park(notification);
            return;
        }
        if let Err(err) = self.apply(&notification).await {
            warn!(
                error = %err,
                content_hash = %notification.content_hash(),
                kind = notification.kind(),
                "failed to apply transport notification; will retry"
            );
            self.metrics.inc_store_failure("dispatcher");
            self.park(notification);
        }
    }

    fn park(&mut self, notification: TransportNotification) {
        let was_empty = self.backlog.is_empty();
        self.backlog.push(notification);
        self.report_backlog(was_empty);
    }

    /// Keep the backlog gauge current and announce health edges.
    fn report_backlog(&self, was_empty: bool) {
        self.metrics.set_retry_backlog(self.backlog.len());
        let degraded = match (was_empty, self.backlog.is_empty()) {
            (true, false) => vec!["store".to_string()],
            (false, true) => Vec::new(),
            _ => return,
        };
        self.events.publish(Event::HealthChanged { degraded });
    }

    async fn retry_backlog(&mut self) {
        let pending = std::mem::take(&mut self.backlog.entries);
        let mut blocked: HashSet<ContentHash> = HashSet::new();
        for notification in pending {
            if blocked.contains(notification.content_hash()) {
                self.backlog.push(notification);
                continue;
            }
            if let Err(err) = self.apply(&notification).await {
                debug!(
                    error = %err,
                    content_hash = %notification.content_hash(),
                    "retry failed"
                );
                self.metrics.inc_store_failure("dispatcher");
                blocked.insert(notification.content_hash().clone());
                self.backlog.push(notification);
            }
        }
        self.report_backlog(false);
    }

    async fn apply(&mut self, notification: &TransportNotification) -> TorrentResult<()> {
        let handle = notification.handle();
        let content_hash = &handle.content_hash;

        let record = self.store.get(content_hash).await?;
        let attached = if handle.is_assigned() {
            self.registry.attach(handle).await
        } else {
            if self.registry.release_pending(content_hash).await {
                info!(
                    content_hash = %content_hash,
                    "transport refused admission; reservation released"
                );
            }
            AttachOutcome::Rejected
        };
        match &attached {
            AttachOutcome::Attached => {
                debug!(content_hash = %content_hash, "transport handle registered");
                self.metrics
                    .set_live_handles(self.registry.live_count().await);
            }
            AttachOutcome::Replaced(previous) => warn!(
                content_hash = %content_hash,
                previous = %previous.session_id,
                current = %handle.session_id,
                "transport re-issued handle"
            ),
            AttachOutcome::Untracked => {
                // No slot owns this handle, so nothing will ever remove it.
                self.metrics.inc_stale_notification();
                debug!(
                    content_hash = %content_hash,
                    kind = notification.kind(),
                    "dropping notification for untracked handle"
                );
                self.reap(handle).await;
                return Ok(());
            }
            AttachOutcome::Unchanged | AttachOutcome::Rejected => {}
        }

        let Some(record) = record else {
            self.metrics.inc_stale_notification();
            debug!(
                content_hash = %content_hash,
                kind = notification.kind(),
                "dropping notification for unknown torrent"
            );
            return Ok(());
        };

        let patch = reconcile(&record, notification);
        if !self.store.update_fields(content_hash, &patch).await? {
            self.metrics.inc_stale_notification();
            debug!(content_hash = %content_hash, "torrent removed before update applied");
            return Ok(());
        }

        self.publish(&record, &patch, notification);
        if let Some(files) = &patch.files {
            self.restore_priorities(handle, files).await;
        }
        Ok(())
    }

    fn publish(&self, record: &TorrentRecord, patch: &TorrentPatch, notification: &TransportNotification) {
        let content_hash = record.content_hash.to_string();
        if let Some(files) = &patch.files {
            self.events.publish(Event::FilesDiscovered {
                content_hash: content_hash.clone(),
                files: files
                    .iter()
                    .map(|file| DiscoveredFile {
                        index: file.index,
                        path: file.path.clone(),
                        size_bytes: file.size_bytes,
                    })
                    .collect(),
            });
        }
        if let Some(state) = patch.state
            && state != record.state
        {
            self.events.publish(Event::StateChanged {
                content_hash: content_hash.clone(),
                state,
            });
        }
        match notification {
            TransportNotification::TorrentFinished { .. } => {
                self.events.publish(Event::Completed { content_hash });
            }
            TransportNotification::TorrentError { message, .. } => warn!(
                content_hash = %record.content_hash,
                error = %message,
                "transport reported torrent error"
            ),
            TransportNotification::MetadataReceived { .. }
            | TransportNotification::StateChanged { .. } => {}
        }
    }

    async fn restore_priorities(&self, handle: &TorrentHandle, files: &[FileRecord]) {
        for file in files.iter().filter(|file| file.priority != FilePriority::Normal) {
            if let Err(err) = self
                .transport
                .set_file_priority(handle, file.index, file.priority)
                .await
            {
                warn!(
                    error = %err,
                    content_hash = %handle.content_hash,
                    index = file.index,
                    "failed to restore file priority"
                );
            }
        }
    }

    async fn reap(&mut self, handle: &TorrentHandle) {
        if !self.reaped.insert(handle.session_id) {
            return;
        }
        info!(
            content_hash = %handle.content_hash,
            session_id = %handle.session_id,
            "removing orphaned transport handle"
        );
        if let Err(err) = self
            .transport
            .remove(handle, RemoveTorrent::default())
            .await
        {
            debug!(error = %err, content_hash = %handle.content_hash, "orphan removal failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tethys_test_support::{FlakyStore, ScriptedTransport, TransportCall, memory_store};
    use tethys_torrent_core::MetadataFile;

    fn dispatcher(
        store: Arc<dyn TorrentStore>,
        transport: Arc<ScriptedTransport>,
        registry: Arc<HandleRegistry>,
        events: EventBus,
        metrics: Metrics,
    ) -> EventDispatcher {
        EventDispatcher::new(
            store,
            transport,
            registry,
            events,
            metrics,
            Duration::from_millis(10),
            8,
        )
    }

    fn record() -> TorrentRecord {
        TorrentRecord::new(
            ContentHash::from_bytes(&[9; 20]),
            "magnet:?xt=urn:btih:0909090909090909090909090909090909090909",
            None,
            "/downloads/x",
        )
    }

    fn handle(record: &TorrentRecord) -> TorrentHandle {
        TorrentHandle::issue(record.content_hash.clone())
    }

    fn metadata() -> TorrentMetadata {
        TorrentMetadata {
            name: "Pack".into(),
            files: vec![
                MetadataFile {
                    path: "Pack/a.mkv".into(),
                    size_bytes: 100,
                },
                MetadataFile {
                    path: "Pack/b.srt".into(),
                    size_bytes: 50,
                },
            ],
            ..TorrentMetadata::default()
        }
    }

    #[test]
    fn engine_states_map_onto_persisted_states() {
        let cases = [
            (EngineState::DownloadingMetadata, TorrentState::MetadataDownloading),
            (EngineState::CheckingFiles, TorrentState::Checking),
            (EngineState::CheckingResumeData, TorrentState::Checking),
            (EngineState::Downloading, TorrentState::Downloading),
            (EngineState::Finished, TorrentState::Seeding),
            (EngineState::Seeding, TorrentState::Seeding),
            (EngineState::Allocating, TorrentState::Stopped),
            (EngineState::Paused, TorrentState::Stopped),
        ];
        for (engine, expected) in cases {
            assert_eq!(map_engine_state(engine), expected, "{engine:?}");
        }
    }

    #[test]
    fn metadata_populates_files_and_upgrades_name() {
        let record = record();
        let notification = TransportNotification::MetadataReceived {
            handle: handle(&record),
            metadata: metadata(),
        };
        let patch = reconcile(&record, &notification);

        assert_eq!(patch.state, Some(TorrentState::Downloading));
        assert_eq!(patch.total_size, Some(150));
        assert_eq!(patch.display_name.as_deref(), Some("Pack"));
        let files = patch.files.as_ref().expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].index, 1);
        assert!(!patch.touches_transfer());
    }

    #[test]
    fn metadata_keeps_persisted_priorities() {
        let mut record = record();
        record.files = vec![FileRecord {
            index: 1,
            path: "Pack/b.srt".into(),
            size_bytes: 50,
            downloaded_bytes: 0,
            priority: FilePriority::DontDownload,
        }];
        let notification = TransportNotification::MetadataReceived {
            handle: handle(&record),
            metadata: metadata(),
        };
        let files = reconcile(&record, &notification).files.expect("files");
        assert_eq!(files[0].priority, FilePriority::Normal);
        assert_eq!(files[1].priority, FilePriority::DontDownload);
    }

    #[test]
    fn blank_metadata_name_keeps_display_name() {
        let record = record();
        let notification = TransportNotification::MetadataReceived {
            handle: handle(&record),
            metadata: TorrentMetadata {
                name: "  ".into(),
                ..metadata()
            },
        };
        assert_eq!(reconcile(&record, &notification).display_name, None);
    }

    #[test]
    fn error_then_state_change_clears_error() {
        let mut record = record();
        let error = TransportNotification::TorrentError {
            handle: handle(&record),
            message: "tracker unreachable".into(),
        };
        reconcile(&record, &error).apply_to(&mut record);
        assert_eq!(record.state, TorrentState::Error);
        assert_eq!(record.last_error.as_deref(), Some("tracker unreachable"));

        let resumed = TransportNotification::StateChanged {
            handle: handle(&record),
            state: EngineState::Downloading,
        };
        reconcile(&record, &resumed).apply_to(&mut record);
        assert_eq!(record.state, TorrentState::Downloading);
        assert_eq!(record.last_error, None);
    }

    #[test]
    fn finish_sets_timestamp_once_and_leaves_counters() {
        let mut record = record();
        record.downloaded_size = 75;
        let finished = TransportNotification::TorrentFinished {
            handle: handle(&record),
        };
        let patch = reconcile(&record, &finished);
        assert_eq!(patch.state, Some(TorrentState::Finished));
        assert!(matches!(patch.finished_at, Some(Some(_))));
        assert!(!patch.touches_transfer());
        patch.apply_to(&mut record);
        assert_eq!(record.downloaded_size, 75);

        let again = reconcile(&record, &finished);
        assert_eq!(again.finished_at, None);
    }

    #[test]
    fn every_notification_lands_in_a_defined_state() {
        let record = record();
        let handle = handle(&record);
        let mut notifications = vec![
            TransportNotification::MetadataReceived {
                handle: handle.clone(),
                metadata: metadata(),
            },
            TransportNotification::TorrentFinished {
                handle: handle.clone(),
            },
            TransportNotification::TorrentError {
                handle: handle.clone(),
                message: "disk full".into(),
            },
        ];
        notifications.extend(
            [
                EngineState::CheckingFiles,
                EngineState::CheckingResumeData,
                EngineState::DownloadingMetadata,
                EngineState::Downloading,
                EngineState::Finished,
                EngineState::Seeding,
                EngineState::Allocating,
                EngineState::Paused,
            ]
            .into_iter()
            .map(|state| TransportNotification::StateChanged {
                handle: handle.clone(),
                state,
            }),
        );
        for notification in &notifications {
            let state = reconcile(&record, notification).state.expect("state");
            assert!(TorrentState::ALL.contains(&state));
        }
    }

    #[test]
    fn backlog_drops_oldest_when_full() {
        let record = record();
        let mut backlog = RetryBacklog::new(2);
        for message in ["a", "b", "c"] {
            backlog.push(TransportNotification::TorrentError {
                handle: handle(&record),
                message: message.into(),
            });
        }
        assert_eq!(backlog.len(), 2);
        assert!(backlog.holds(&record.content_hash));
        let first = backlog.entries.front().expect("entry");
        assert!(matches!(first, TransportNotification::TorrentError { message, .. } if message == "b"));
    }

    #[tokio::test]
    async fn failed_writes_are_retried_in_order() -> anyhow::Result<()> {
        let record = record();
        let store = Arc::new(FlakyStore::new(memory_store().await?));
        store.upsert(&record).await?;
        store.fail("update_fields");
        let registry = Arc::new(HandleRegistry::default());
        registry.reserve(&record.content_hash).await;
        let events = EventBus::new();
        let mut stream = events.subscribe(None);
        let mut dispatcher = dispatcher(
            store.clone(),
            Arc::new(ScriptedTransport::new()),
            registry,
            events,
            Metrics::new()?,
        );

        let handle = handle(&record);
        dispatcher
            .handle(TransportNotification::TorrentError {
                handle: handle.clone(),
                message: "disk full".into(),
            })
            .await;
        dispatcher
            .handle(TransportNotification::StateChanged {
                handle,
                state: EngineState::Downloading,
            })
            .await;
        assert_eq!(dispatcher.backlog.len(), 2);

        dispatcher.retry_backlog().await;
        assert_eq!(dispatcher.backlog.len(), 2);

        store.heal("update_fields");
        dispatcher.retry_backlog().await;
        assert!(dispatcher.backlog.is_empty());

        let stored = store.get(&record.content_hash).await?.expect("record");
        assert_eq!(stored.state, TorrentState::Downloading);
        assert_eq!(stored.last_error, None);

        let mut health = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(20), stream.next()).await
        {
            if let Event::HealthChanged { degraded } = envelope.event {
                health.push(degraded);
            }
        }
        assert_eq!(health, vec![vec!["store".to_string()], Vec::new()]);
        Ok(())
    }

    #[tokio::test]
    async fn untracked_handles_are_reaped_even_with_a_record() -> anyhow::Result<()> {
        // The record outlives its slot while a removal is in flight.
        let record = record();
        let store = memory_store().await?;
        store.upsert(&record).await?;
        let transport = Arc::new(ScriptedTransport::new());
        let metrics = Metrics::new()?;
        let mut dispatcher = dispatcher(
            Arc::new(store.clone()),
            transport.clone(),
            Arc::new(HandleRegistry::default()),
            EventBus::new(),
            metrics.clone(),
        );

        let handle = handle(&record);
        for state in [EngineState::Downloading, EngineState::Seeding] {
            dispatcher
                .handle(TransportNotification::StateChanged {
                    handle: handle.clone(),
                    state,
                })
                .await;
        }

        let removals = transport
            .calls()
            .into_iter()
            .filter(|call| matches!(call, TransportCall::Remove { .. }))
            .count();
        assert_eq!(removals, 1);
        assert_eq!(metrics.snapshot().stale_notifications_total, 2);
        let stored = store.get(&record.content_hash).await?.expect("record");
        assert_eq!(stored.state, record.state);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_admission_records_error_and_frees_the_slot() -> anyhow::Result<()> {
        let record = record();
        let store = memory_store().await?;
        store.upsert(&record).await?;
        let registry = Arc::new(HandleRegistry::default());
        registry.reserve(&record.content_hash).await;
        let transport = Arc::new(ScriptedTransport::new());
        let mut dispatcher = dispatcher(
            Arc::new(store.clone()),
            transport.clone(),
            registry.clone(),
            EventBus::new(),
            Metrics::new()?,
        );

        dispatcher
            .handle(TransportNotification::TorrentError {
                handle: TorrentHandle::unassigned(record.content_hash.clone()),
                message: "invalid torrent file".into(),
            })
            .await;

        assert!(!registry.contains(&record.content_hash).await);
        assert!(transport.calls().is_empty());
        let stored = store.get(&record.content_hash).await?.expect("record");
        assert_eq!(stored.state, TorrentState::Error);
        assert_eq!(stored.last_error.as_deref(), Some("invalid torrent file"));
        Ok(())
    }
}
