//! Session engine facade: control operations, reads, recovery and shutdown.
//!
//! # Design
//! - The engine is constructed explicitly with its collaborators and owns the
//!   handle registry plus the three background loops.
//! - Records are persisted before the transport is asked to add a torrent, so
//!   the dispatcher never sees a handle for a hash it cannot find.
//! - Writes are partial merges; the engine never replaces a whole record once
//!   it exists.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tethys_events::{Event, EventBus};
use tethys_telemetry::Metrics;
use tethys_torrent_core::{
    AddTorrent, ContentHash, FilePriority, FilePriorityOverride, KeepaliveSink, RemoveTorrent,
    TorrentError, TorrentInspector, TorrentPatch, TorrentRecord, TorrentResult, TorrentSnapshot,
    TorrentState, TorrentStats, TorrentStore, TorrentWorkflow, TransportEngine,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::EventDispatcher;
use crate::lifecycle::LifecycleController;
use crate::poller::StatsPoller;
use crate::registry::{HandleRegistry, HandleSlot};

/// Default cadence of transfer status sampling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Default cadence of dispatcher retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);
/// Default bound of the dispatcher retry backlog.
pub const DEFAULT_RETRY_BACKLOG: usize = 1_024;
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process tunables for the session engine.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Cadence of transfer status sampling.
    pub poll_interval: Duration,
    /// Cadence of dispatcher retries for failed store writes.
    pub retry_interval: Duration,
    /// Maximum notifications parked for retry.
    pub retry_backlog: usize,
    /// Save path used when a caller passes a blank one.
    pub download_root: PathBuf,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            retry_backlog: DEFAULT_RETRY_BACKLOG,
            download_root: PathBuf::from("downloads"),
        }
    }
}

/// Collaborators handed to [`SessionEngine::init`].
pub struct SessionDeps {
    /// BitTorrent transport.
    pub transport: Arc<dyn TransportEngine>,
    /// Durable record store.
    pub store: Arc<dyn TorrentStore>,
    /// Receiver of keepalive transitions.
    pub keepalive: Arc<dyn KeepaliveSink>,
    /// Domain event bus.
    pub events: EventBus,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Engine tunables.
    pub options: SessionOptions,
}

/// How an admission treats the persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    /// Insert a brand new record; deleted again if the transport refuses it.
    Insert,
    /// Reset an existing record to `MetadataDownloading` and clear its error.
    Reset,
    /// Leave the record untouched (startup recovery).
    Keep,
}

/// Entry point for every control operation and read.
pub struct SessionEngine {
    transport: Arc<dyn TransportEngine>,
    store: Arc<dyn TorrentStore>,
    registry: Arc<HandleRegistry>,
    events: EventBus,
    metrics: Metrics,
    options: SessionOptions,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl SessionEngine {
    /// Start the background loops and re-admit every active record.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::TransportUnavailable`] when the transport's
    /// notification stream has already been claimed.
    pub async fn init(deps: SessionDeps) -> TorrentResult<Self> {
        let SessionDeps {
            transport,
            store,
            keepalive,
            events,
            metrics,
            options,
        } = deps;

        let notifications =
            transport
                .take_notifications()
                .ok_or(TorrentError::TransportUnavailable {
                    operation: "take_notifications",
                })?;
        let (shutdown, _) = watch::channel(false);
        let registry = Arc::new(HandleRegistry::default());

        let lifecycle = LifecycleController::new(keepalive, events.clone(), metrics.clone())
            .spawn(store.subscribe_all(), shutdown.subscribe());
        let dispatcher = EventDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&registry),
            events.clone(),
            metrics.clone(),
            options.retry_interval,
            options.retry_backlog,
        )
        .spawn(notifications, shutdown.subscribe());
        let poller = StatsPoller::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&registry),
            metrics.clone(),
            options.poll_interval,
        )
        .spawn(shutdown.subscribe());

        let engine = Self {
            transport,
            store,
            registry,
            events,
            metrics,
            options,
            shutdown,
            tasks: Mutex::new(vec![lifecycle, dispatcher, poller]),
            stopped: AtomicBool::new(false),
        };
        engine.recover().await;
        Ok(engine)
    }

    async fn recover(&self) {
        let records = match self.store.list_where(&TorrentState::ACTIVE).await {
            Ok(records) => records,
            Err(err) => {
                self.metrics.inc_recovery_failure();
                warn!(error = %err, "failed to load active torrents for recovery");
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        info!(count = records.len(), "recovering active torrents");
        for record in records {
            if let Err(err) = self.admit(&record, Persist::Keep).await {
                self.metrics.inc_recovery_failure();
                warn!(
                    error = %err,
                    content_hash = %record.content_hash,
                    "failed to recover torrent"
                );
            }
        }
    }

    /// Admit a source URI and return its content hash.
    ///
    /// Adding a hash that is already tracked returns it unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::InvalidSource`] for unparseable sources,
    /// [`TorrentError::TransportUnavailable`] when the transport is stopped,
    /// and store or filesystem errors from persisting the record.
    pub async fn add(&self, source_uri: &str, save_path: &str) -> TorrentResult<ContentHash> {
        let descriptor = self.transport.parse_source(source_uri)?;
        if !self.transport.is_running() {
            return Err(TorrentError::TransportUnavailable { operation: "add" });
        }
        let content_hash = descriptor.content_hash.clone();

        let existing = self.store.get(&content_hash).await?;
        if existing.is_some() && self.registry.contains(&content_hash).await {
            debug!(content_hash = %content_hash, "torrent already tracked");
            return Ok(content_hash);
        }

        match existing {
            Some(record) => self.admit(&record, Persist::Reset).await?,
            None => {
                let mut record = TorrentRecord::new(
                    content_hash.clone(),
                    source_uri.trim(),
                    descriptor.display_name,
                    self.resolve_save_path(save_path),
                );
                record.trackers = descriptor.trackers;
                self.admit(&record, Persist::Insert).await?;
            }
        }
        Ok(content_hash)
    }

    async fn admit(&self, record: &TorrentRecord, persist: Persist) -> TorrentResult<()> {
        let content_hash = &record.content_hash;
        if !self.registry.reserve(content_hash).await {
            debug!(content_hash = %content_hash, "admission already in flight");
            return Ok(());
        }
        let admitted = self.admit_reserved(record, persist).await;
        if admitted.is_err() {
            self.registry.remove(content_hash).await;
        }
        admitted
    }

    async fn admit_reserved(&self, record: &TorrentRecord, persist: Persist) -> TorrentResult<()> {
        let content_hash = &record.content_hash;
        ensure_directory(Path::new(&record.save_path)).await?;

        match persist {
            Persist::Insert => self.store.upsert(record).await?,
            Persist::Reset => {
                let patch = TorrentPatch::state(TorrentState::MetadataDownloading).clearing_error();
                self.store.update_fields(content_hash, &patch).await?;
            }
            Persist::Keep => {}
        }

        let request = AddTorrent {
            content_hash: content_hash.clone(),
            source_uri: record.source_uri.clone(),
            save_path: record.save_path.clone(),
            sequential: record.sequential_download,
        };
        if let Err(err) = self.transport.add(request).await {
            if persist == Persist::Insert
                && let Err(cleanup) = self.store.delete(content_hash).await
            {
                warn!(
                    error = %cleanup,
                    content_hash = %content_hash,
                    "failed to discard record after rejected add"
                );
            }
            return Err(err);
        }

        if persist == Persist::Insert {
            self.events.publish(Event::TorrentAdded {
                content_hash: content_hash.to_string(),
                name: record.display_name.clone(),
            });
        }
        info!(
            content_hash = %content_hash,
            save_path = %record.save_path,
            "torrent admitted"
        );
        Ok(())
    }

    fn resolve_save_path(&self, save_path: &str) -> String {
        let trimmed = save_path.trim();
        if trimmed.is_empty() {
            self.options.download_root.to_string_lossy().into_owned()
        } else {
            trimmed.to_string()
        }
    }

    /// Pause a torrent and record it as `Stopped`. Unknown hashes are a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns transport or store failures.
    pub async fn pause(&self, content_hash: &ContentHash) -> TorrentResult<()> {
        match self.registry.live(content_hash).await {
            Some(handle) => self.transport.pause(&handle).await?,
            None => debug!(content_hash = %content_hash, "no live handle to pause"),
        }
        let patch = TorrentPatch::state(TorrentState::Stopped).clearing_error();
        self.write_state(content_hash, patch).await
    }

    /// Resume a torrent and record it as `Downloading`, clearing any error.
    ///
    /// A record with no registered handle is re-admitted through the add path.
    /// Unknown hashes are a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns transport, store or filesystem failures.
    pub async fn resume(&self, content_hash: &ContentHash) -> TorrentResult<()> {
        if self.registry.contains(content_hash).await {
            if let Some(handle) = self.registry.live(content_hash).await {
                self.transport.resume(&handle).await?;
            }
            let patch = TorrentPatch::state(TorrentState::Downloading).clearing_error();
            return self.write_state(content_hash, patch).await;
        }

        match self.store.get(content_hash).await? {
            Some(record) => {
                if !self.transport.is_running() {
                    return Err(TorrentError::TransportUnavailable { operation: "resume" });
                }
                self.admit(&record, Persist::Reset).await?;
                self.publish_state(content_hash, TorrentState::MetadataDownloading);
                Ok(())
            }
            None => {
                info!(content_hash = %content_hash, "resume for unknown torrent ignored");
                Ok(())
            }
        }
    }

    async fn write_state(&self, content_hash: &ContentHash, patch: TorrentPatch) -> TorrentResult<()> {
        if self.store.update_fields(content_hash, &patch).await? {
            if let Some(state) = patch.state {
                self.publish_state(content_hash, state);
            }
        } else {
            info!(content_hash = %content_hash, "state change for unknown torrent ignored");
        }
        Ok(())
    }

    fn publish_state(&self, content_hash: &ContentHash, state: TorrentState) {
        self.events.publish(Event::StateChanged {
            content_hash: content_hash.to_string(),
            state,
        });
    }

    /// Remove a torrent, optionally deleting its payload. Unknown hashes succeed.
    ///
    /// # Errors
    ///
    /// Returns store failures and local payload deletion failures.
    pub async fn remove(&self, content_hash: &ContentHash, options: RemoveTorrent) -> TorrentResult<()> {
        let record = self.store.get(content_hash).await?;
        let slot = self.registry.remove(content_hash).await;

        let mut delete_locally = options.with_data;
        if let Some(HandleSlot::Live(handle)) = &slot {
            match self.transport.remove(handle, options).await {
                Ok(()) => delete_locally = false,
                Err(err) => warn!(
                    error = %err,
                    content_hash = %content_hash,
                    "transport remove failed; continuing with local cleanup"
                ),
            }
            self.metrics
                .set_live_handles(self.registry.live_count().await);
        }

        let Some(record) = record else {
            info!(content_hash = %content_hash, "remove for unknown torrent ignored");
            return Ok(());
        };
        if self.store.delete(content_hash).await? {
            self.events.publish(Event::TorrentRemoved {
                content_hash: content_hash.to_string(),
                with_data: options.with_data,
            });
        }
        info!(
            content_hash = %content_hash,
            with_data = options.with_data,
            "torrent removed"
        );

        if delete_locally {
            delete_payload(&record).await?;
        }
        Ok(())
    }

    /// Change several file priorities at once.
    ///
    /// Indices the record does not know are ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::NotFound`] for unknown hashes, plus transport
    /// and store failures.
    pub async fn set_file_priorities(
        &self,
        content_hash: &ContentHash,
        changes: &[FilePriorityOverride],
    ) -> TorrentResult<()> {
        let record = self.require(content_hash).await?;
        let (known, unknown): (Vec<_>, Vec<_>) = changes
            .iter()
            .copied()
            .partition(|change| record.file(change.index).is_some());
        for change in &unknown {
            warn!(
                content_hash = %content_hash,
                index = change.index,
                "ignoring priority for unknown file"
            );
        }
        if known.is_empty() {
            return Ok(());
        }

        if let Some(handle) = self.registry.live(content_hash).await {
            for change in &known {
                self.transport
                    .set_file_priority(&handle, change.index, change.priority)
                    .await?;
            }
        }
        if self.store.set_file_priorities(content_hash, &known).await? {
            Ok(())
        } else {
            Err(not_found(content_hash))
        }
    }

    /// Change one file's priority.
    ///
    /// # Errors
    ///
    /// See [`SessionEngine::set_file_priorities`].
    pub async fn set_file_priority(
        &self,
        content_hash: &ContentHash,
        index: u32,
        priority: FilePriority,
    ) -> TorrentResult<()> {
        self.set_file_priorities(content_hash, &[FilePriorityOverride { index, priority }])
            .await
    }

    async fn require(&self, content_hash: &ContentHash) -> TorrentResult<TorrentRecord> {
        self.store
            .get(content_hash)
            .await?
            .ok_or_else(|| not_found(content_hash))
    }

    /// Fetch one record.
    ///
    /// # Errors
    ///
    /// Returns [`TorrentError::NotFound`] for unknown hashes.
    pub async fn get(&self, content_hash: &ContentHash) -> TorrentResult<TorrentRecord> {
        self.require(content_hash).await
    }

    /// Every record, newest first.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn list(&self) -> TorrentResult<Vec<TorrentRecord>> {
        self.store.list_all().await
    }

    /// Records currently in `state`, newest first.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn list_by_state(&self, state: TorrentState) -> TorrentResult<Vec<TorrentRecord>> {
        self.store.list_where(&[state]).await
    }

    /// Number of persisted records.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn count(&self) -> TorrentResult<usize> {
        self.store.count().await
    }

    /// Aggregate counters over the catalogue.
    ///
    /// # Errors
    ///
    /// Returns store failures.
    pub async fn stats(&self) -> TorrentResult<TorrentStats> {
        Ok(TorrentStats::from_records(&self.store.list_all().await?))
    }

    /// Push subscription of the full record list.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TorrentSnapshot> {
        self.store.subscribe_all()
    }

    /// Push subscription of a single record; `None` while it does not exist.
    #[must_use]
    pub fn subscribe_torrent(&self, content_hash: &ContentHash) -> watch::Receiver<Option<TorrentRecord>> {
        let mut source = self.store.subscribe_all();
        let content_hash = content_hash.clone();
        let initial = find_record(&source.borrow_and_update(), &content_hash);
        let (sender, receiver) = watch::channel(initial);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sender.closed() => break,
                    changed = source.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = find_record(&source.borrow_and_update(), &content_hash);
                        sender.send_if_modified(|current| {
                            if *current == next {
                                false
                            } else {
                                *current = next;
                                true
                            }
                        });
                    }
                }
            }
        });
        receiver
    }

    /// Domain event bus the engine publishes on.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stop every loop and release the transport. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns the transport's shutdown failure.
    pub async fn shutdown(&self) -> TorrentResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("session engine shutting down");
        let _ = self.shutdown.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for mut task in tasks {
            if tokio::time::timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("background loop did not stop in time; aborting");
                task.abort();
            }
        }
        self.transport.shutdown().await
    }
}

fn find_record(records: &[TorrentRecord], content_hash: &ContentHash) -> Option<TorrentRecord> {
    records
        .iter()
        .find(|record| record.content_hash == *content_hash)
        .cloned()
}

fn not_found(content_hash: &ContentHash) -> TorrentError {
    TorrentError::NotFound {
        content_hash: content_hash.clone(),
    }
}

async fn ensure_directory(path: &Path) -> TorrentResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| TorrentError::Filesystem {
            operation: "create_save_path",
            path: path.to_path_buf(),
            source,
        })
}

/// Delete a record's payload files, then any directories they leave empty.
async fn delete_payload(record: &TorrentRecord) -> TorrentResult<()> {
    let root = Path::new(&record.save_path);
    let mut parents = BTreeSet::new();
    for file in &record.files {
        let path = root.join(&file.path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(TorrentError::Filesystem {
                    operation: "delete_payload",
                    path,
                    source,
                });
            }
        }
        let mut parent = path.parent();
        while let Some(dir) = parent.filter(|dir| *dir != root && dir.starts_with(root)) {
            parents.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }
    // Deepest first so nested directories empty out before their parents.
    for dir in parents.iter().rev() {
        if let Err(err) = tokio::fs::remove_dir(dir).await {
            debug!(error = %err, path = %dir.display(), "payload directory left in place");
        }
    }
    debug!(content_hash = %record.content_hash, "payload deleted");
    Ok(())
}

#[async_trait]
impl TorrentWorkflow for SessionEngine {
    async fn add_torrent(&self, source_uri: &str, save_path: &str) -> TorrentResult<ContentHash> {
        self.add(source_uri, save_path).await
    }

    async fn pause_torrent(&self, content_hash: &ContentHash) -> TorrentResult<()> {
        self.pause(content_hash).await
    }

    async fn resume_torrent(&self, content_hash: &ContentHash) -> TorrentResult<()> {
        self.resume(content_hash).await
    }

    async fn remove_torrent(&self, content_hash: &ContentHash, options: RemoveTorrent) -> TorrentResult<()> {
        self.remove(content_hash, options).await
    }

    async fn set_file_priorities(
        &self,
        content_hash: &ContentHash,
        changes: &[FilePriorityOverride],
    ) -> TorrentResult<()> {
        Self::set_file_priorities(self, content_hash, changes).await
    }
}

#[async_trait]
impl TorrentInspector for SessionEngine {
    async fn get_torrent(&self, content_hash: &ContentHash) -> TorrentResult<TorrentRecord> {
        self.get(content_hash).await
    }

    async fn list_torrents(&self) -> TorrentResult<Vec<TorrentRecord>> {
        self.list().await
    }

    async fn stats(&self) -> TorrentResult<TorrentStats> {
        Self::stats(self).await
    }

    fn subscribe_torrents(&self) -> watch::Receiver<TorrentSnapshot> {
        self.subscribe()
    }
}
