use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tethys_app::{SessionDeps, SessionEngine, SessionOptions};
use tethys_events::{Event, EventBus};
use tethys_runtime::RuntimeStore;
use tethys_telemetry::Metrics;
use tethys_test_support::{
    FlakyStore, RecordingKeepalive, ScriptedTransport, TransportCall, magnet_uri, memory_store,
    sample_hash, sample_metadata, wait_for_record, wait_until,
};
use tethys_torrent_core::{
    ContentHash, EngineState, FilePriority, FileRecord, KeepaliveSignal, RemoveTorrent,
    TorrentError, TorrentHandle, TorrentRecord, TorrentState, TorrentStore, TransferStats,
    TransportEngine, TransportNotification,
};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    engine: SessionEngine,
    transport: Arc<ScriptedTransport>,
    store: RuntimeStore,
    flaky: Arc<FlakyStore>,
    keepalive: RecordingKeepalive,
    events: EventBus,
    metrics: Metrics,
    dir: TempDir,
}

impl Harness {
    async fn start() -> Result<Self> {
        Self::start_with(ScriptedTransport::new(), memory_store().await?).await
    }

    async fn start_with(transport: ScriptedTransport, store: RuntimeStore) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(transport);
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let keepalive = RecordingKeepalive::new();
        let events = EventBus::new();
        let metrics = Metrics::new()?;
        let engine = SessionEngine::init(SessionDeps {
            transport: transport.clone(),
            store: flaky.clone(),
            keepalive: Arc::new(keepalive.clone()),
            events: events.clone(),
            metrics: metrics.clone(),
            options: SessionOptions {
                poll_interval: Duration::from_millis(20),
                retry_interval: Duration::from_millis(20),
                download_root: dir.path().join("downloads"),
                ..SessionOptions::default()
            },
        })
        .await?;
        Ok(Self {
            engine,
            transport,
            store,
            flaky,
            keepalive,
            events,
            metrics,
            dir,
        })
    }

    fn save_path(&self, name: &str) -> String {
        self.dir.path().join(name).to_string_lossy().into_owned()
    }

    async fn add(&self, seed: u8, name: &str) -> Result<ContentHash> {
        let hash = sample_hash(seed);
        let added = self
            .engine
            .add(&magnet_uri(&hash, Some(name)), &self.save_path(name))
            .await?;
        assert_eq!(added, hash);
        Ok(hash)
    }

    async fn emit(&self, notification: TransportNotification) {
        self.transport.emit(notification).await;
    }

    async fn metadata(&self, hash: &ContentHash, files: &[(&str, u64)]) {
        self.emit(TransportNotification::MetadataReceived {
            handle: self.transport.handle_for(hash),
            metadata: sample_metadata("Pack", files),
        })
        .await;
    }

    async fn wait_for<P>(&self, hash: &ContentHash, predicate: P) -> Result<TorrentRecord>
    where
        P: Fn(&TorrentRecord) -> bool,
    {
        wait_for_record(&self.store, hash, WAIT, predicate).await
    }

    async fn published(&self) -> Vec<Event> {
        let mut stream = self.events.subscribe(Some(0));
        let mut events = Vec::new();
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(20), stream.next()).await
        {
            events.push(envelope.event);
        }
        events
    }
}

fn stored_record(seed: u8, state: TorrentState, save_path: &Path) -> TorrentRecord {
    let hash = sample_hash(seed);
    let mut record = TorrentRecord::new(
        hash.clone(),
        magnet_uri(&hash, Some("stored")),
        Some("stored".into()),
        save_path.to_string_lossy().into_owned(),
    );
    record.state = state;
    record
}

#[tokio::test]
async fn add_is_idempotent_for_tracked_hashes() -> Result<()> {
    let harness = Harness::start_with(ScriptedTransport::announcing(), memory_store().await?).await?;
    let hash = harness.add(1, "Movie").await?;
    let record = harness.engine.get(&hash).await?;
    assert_eq!(record.state, TorrentState::MetadataDownloading);
    assert_eq!(record.display_name, "Movie");

    let again = harness
        .engine
        .add(&magnet_uri(&hash, Some("Movie")), &harness.save_path("other"))
        .await?;
    assert_eq!(again, hash);
    assert_eq!(harness.transport.add_count(&hash), 1);
    assert_eq!(harness.engine.count().await?, 1);
    assert!(
        harness
            .published()
            .await
            .iter()
            .any(|event| matches!(event, Event::TorrentAdded { name, .. } if name == "Movie"))
    );

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn operations_on_unknown_hashes() -> Result<()> {
    let harness = Harness::start().await?;
    let unknown = sample_hash(0xee);

    harness.engine.pause(&unknown).await?;
    harness.engine.resume(&unknown).await?;
    harness
        .engine
        .remove(&unknown, RemoveTorrent { with_data: true })
        .await?;

    let err = harness.engine.get(&unknown).await.expect_err("read of unknown hash");
    assert!(err.is_not_found());
    let err = harness
        .engine
        .set_file_priority(&unknown, 0, FilePriority::High)
        .await
        .expect_err("priority on unknown hash");
    assert!(err.is_not_found());
    assert!(harness.transport.calls().is_empty());

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn add_metadata_poll_and_finish() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(0xab, "hashABC").await?;
    assert_eq!(
        harness.engine.get(&hash).await?.state,
        TorrentState::MetadataDownloading
    );

    harness.metadata(&hash, &[("Pack/a.mkv", 100), ("Pack/b.srt", 50)]).await;
    let record = harness
        .wait_for(&hash, |record| record.state == TorrentState::Downloading)
        .await?;
    assert_eq!(record.total_size, 150);
    assert_eq!(record.files.len(), 2);
    assert_eq!(record.display_name, "Pack");

    harness.transport.set_status(
        &hash,
        TransferStats {
            progress: 0.5,
            downloaded_size: 75,
            download_rate: 10,
            num_peers: 3,
            ..TransferStats::default()
        },
    );
    let record = harness
        .wait_for(&hash, |record| record.downloaded_size == 75)
        .await?;
    assert!((record.computed_progress() - 0.5).abs() < f64::EPSILON);
    assert_eq!(record.state, TorrentState::Downloading);

    harness
        .emit(TransportNotification::TorrentFinished {
            handle: harness.transport.handle_for(&hash),
        })
        .await;
    let record = harness
        .wait_for(&hash, |record| record.state == TorrentState::Finished)
        .await?;
    assert!(record.finished_at.is_some());
    assert_eq!(record.downloaded_size, 75);
    assert_eq!(record.total_size, 150);

    let stats = harness.engine.stats().await?;
    assert_eq!(stats.total, 1);
    assert!(
        harness
            .published()
            .await
            .iter()
            .any(|event| matches!(event, Event::Completed { .. }))
    );

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn error_then_downloading_clears_last_error() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(2, "Flaky").await?;
    let handle = harness.transport.handle_for(&hash);

    harness
        .emit(TransportNotification::TorrentError {
            handle: handle.clone(),
            message: "tracker unreachable".into(),
        })
        .await;
    let record = harness
        .wait_for(&hash, |record| record.state == TorrentState::Error)
        .await?;
    assert_eq!(record.last_error.as_deref(), Some("tracker unreachable"));

    harness
        .emit(TransportNotification::StateChanged {
            handle,
            state: EngineState::Downloading,
        })
        .await;
    let record = harness
        .wait_for(&hash, |record| record.state == TorrentState::Downloading)
        .await?;
    assert_eq!(record.last_error, None);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pause_clears_a_reported_error() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(21, "Broken").await?;
    harness
        .emit(TransportNotification::TorrentError {
            handle: harness.transport.handle_for(&hash),
            message: "boom".into(),
        })
        .await;
    harness
        .wait_for(&hash, |record| record.state == TorrentState::Error)
        .await?;

    harness.engine.pause(&hash).await?;
    let record = harness.engine.get(&hash).await?;
    assert_eq!(record.state, TorrentState::Stopped);
    assert_eq!(record.last_error, None);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn refused_admission_is_retried_by_resume() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(22, "Refused").await?;
    harness
        .emit(TransportNotification::TorrentError {
            handle: TorrentHandle::unassigned(hash.clone()),
            message: "invalid torrent file".into(),
        })
        .await;
    harness
        .wait_for(&hash, |record| record.state == TorrentState::Error)
        .await?;
    assert_eq!(harness.metrics.snapshot().live_handles, 0);

    harness.engine.resume(&hash).await?;
    assert_eq!(harness.transport.add_count(&hash), 2);
    let record = harness.engine.get(&hash).await?;
    assert_eq!(record.state, TorrentState::MetadataDownloading);
    assert_eq!(record.last_error, None);
    assert!(!harness.transport.calls().contains(&TransportCall::Resume(hash.clone())));

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn remove_keeps_the_handle_when_the_record_cannot_be_read() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(23, "Sticky").await?;
    harness
        .emit(TransportNotification::StateChanged {
            handle: harness.transport.handle_for(&hash),
            state: EngineState::Downloading,
        })
        .await;
    harness
        .wait_for(&hash, |record| record.state == TorrentState::Downloading)
        .await?;

    harness.flaky.fail("get");
    let err = harness
        .engine
        .remove(&hash, RemoveTorrent::default())
        .await
        .expect_err("store read failure");
    assert!(matches!(err, TorrentError::Store { .. }));
    harness.flaky.heal("get");
    assert!(harness.store.get(&hash).await?.is_some());

    harness.engine.remove(&hash, RemoveTorrent::default()).await?;
    assert!(harness.transport.calls().contains(&TransportCall::Remove {
        content_hash: hash.clone(),
        with_data: false,
    }));
    assert!(harness.store.get(&hash).await?.is_none());

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn poller_and_dispatcher_writes_both_survive() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(3, "Shared").await?;
    harness.metadata(&hash, &[("Shared/a.bin", 1_000)]).await;
    harness
        .wait_for(&hash, |record| record.state == TorrentState::Downloading)
        .await?;

    harness.transport.set_status(
        &hash,
        TransferStats {
            progress: 0.3,
            downloaded_size: 300,
            ..TransferStats::default()
        },
    );
    harness
        .emit(TransportNotification::StateChanged {
            handle: harness.transport.handle_for(&hash),
            state: EngineState::Seeding,
        })
        .await;

    let record = harness
        .wait_for(&hash, |record| {
            record.state == TorrentState::Seeding && record.downloaded_size == 300
        })
        .await?;
    assert!((record.progress - 0.3).abs() < f64::EPSILON);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn keepalive_follows_active_records() -> Result<()> {
    let harness = Harness::start().await?;
    assert!(harness.keepalive.signals().is_empty());

    let hash = harness.add(4, "Keep").await?;
    let keepalive = &harness.keepalive;
    wait_until("keepalive start", WAIT, || async move {
        (keepalive.last() == Some(KeepaliveSignal::Start { active: 1 })).then_some(())
    })
    .await?;

    harness.engine.remove(&hash, RemoveTorrent::default()).await?;
    wait_until("keepalive stop", WAIT, || async move {
        (keepalive.last() == Some(KeepaliveSignal::Stop)).then_some(())
    })
    .await?;
    assert_eq!(harness.keepalive.signals().len(), 2);
    assert!(
        harness
            .published()
            .await
            .iter()
            .any(|event| matches!(event, Event::KeepaliveChanged { active: false, .. }))
    );

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn startup_recovers_active_records_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = memory_store().await?;
    let active = stored_record(5, TorrentState::Downloading, dir.path());
    let idle = stored_record(6, TorrentState::Stopped, dir.path());
    store.upsert(&active).await?;
    store.upsert(&idle).await?;

    let harness = Harness::start_with(ScriptedTransport::new(), store).await?;
    assert_eq!(harness.transport.add_count(&active.content_hash), 1);
    assert_eq!(harness.transport.add_count(&idle.content_hash), 0);

    let keepalive = &harness.keepalive;
    wait_until("keepalive from persisted records", WAIT, || async move {
        (keepalive.last() == Some(KeepaliveSignal::Start { active: 1 })).then_some(())
    })
    .await?;

    let recovered = harness.engine.get(&active.content_hash).await?;
    assert_eq!(recovered.source_uri, active.source_uri);
    assert_eq!(recovered.save_path, active.save_path);
    assert_eq!(recovered.state, TorrentState::Downloading);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn corrupt_row_does_not_stop_recovery() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = memory_store().await?;
    let broken = stored_record(24, TorrentState::Downloading, dir.path());
    let healthy = stored_record(25, TorrentState::Seeding, dir.path());
    store.upsert(&broken).await?;
    store.upsert(&healthy).await?;
    sqlx::query("UPDATE torrents SET trackers = '{' WHERE content_hash = ?")
        .bind(broken.content_hash.as_str())
        .execute(store.pool())
        .await?;

    let harness = Harness::start_with(ScriptedTransport::new(), store).await?;
    assert_eq!(harness.transport.add_count(&healthy.content_hash), 1);
    assert_eq!(harness.transport.add_count(&broken.content_hash), 0);
    assert_eq!(harness.engine.list().await?.len(), 1);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn failed_recovery_does_not_block_startup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = memory_store().await?;
    store
        .upsert(&stored_record(7, TorrentState::Seeding, dir.path()))
        .await?;
    let transport = ScriptedTransport::new();
    transport.fail("add");

    let harness = Harness::start_with(transport, store).await?;
    assert_eq!(harness.metrics.snapshot().recovery_failures_total, 1);
    assert_eq!(harness.engine.count().await?, 1);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn notifications_after_remove_do_not_resurrect() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(8, "Gone").await?;
    let handle = harness.transport.handle_for(&hash);
    harness
        .emit(TransportNotification::StateChanged {
            handle: handle.clone(),
            state: EngineState::DownloadingMetadata,
        })
        .await;
    let metrics = &harness.metrics;
    wait_until("handle attached", WAIT, || async move {
        (metrics.snapshot().live_handles == 1).then_some(())
    })
    .await?;

    harness.engine.remove(&hash, RemoveTorrent::default()).await?;
    assert!(harness.store.get(&hash).await?.is_none());

    harness.metadata(&hash, &[("Gone/a.bin", 10)]).await;
    wait_until("stale notification dropped", WAIT, || async move {
        (metrics.snapshot().stale_notifications_total >= 1).then_some(())
    })
    .await?;
    assert!(harness.store.get(&hash).await?.is_none());

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn priority_changes_update_selected_size() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(9, "Season").await?;
    harness.metadata(&hash, &[("Season/e01.mkv", 100), ("Season/e02.mkv", 50)]).await;
    let record = harness
        .wait_for(&hash, |record| record.files.len() == 2)
        .await?;
    assert_eq!(record.selected_size(), 150);

    harness
        .engine
        .set_file_priority(&hash, 1, FilePriority::DontDownload)
        .await?;
    harness
        .engine
        .set_file_priority(&hash, 42, FilePriority::High)
        .await?;

    let record = harness.engine.get(&hash).await?;
    assert_eq!(record.selected_size(), 100);
    assert_eq!(record.files[0].priority, FilePriority::Normal);
    assert_eq!(record.files[1].priority, FilePriority::DontDownload);
    assert!(harness.transport.calls().contains(&TransportCall::SetFilePriority {
        content_hash: hash.clone(),
        index: 1,
        priority: FilePriority::DontDownload,
    }));

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn resume_readmits_and_restores_priorities() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = memory_store().await?;
    let mut stopped = stored_record(10, TorrentState::Error, dir.path());
    stopped.last_error = Some("disk full".into());
    stopped.files = vec![
        FileRecord {
            index: 0,
            path: "stored/a.mkv".into(),
            size_bytes: 100,
            downloaded_bytes: 0,
            priority: FilePriority::Normal,
        },
        FileRecord {
            index: 1,
            path: "stored/b.nfo".into(),
            size_bytes: 1,
            downloaded_bytes: 0,
            priority: FilePriority::DontDownload,
        },
    ];
    store.upsert(&stopped).await?;

    let harness = Harness::start_with(ScriptedTransport::new(), store).await?;
    let hash = stopped.content_hash.clone();
    assert_eq!(harness.transport.add_count(&hash), 0);

    harness.engine.resume(&hash).await?;
    let record = harness.engine.get(&hash).await?;
    assert_eq!(record.state, TorrentState::MetadataDownloading);
    assert_eq!(record.last_error, None);
    assert_eq!(harness.transport.add_count(&hash), 1);

    harness.metadata(&hash, &[("stored/a.mkv", 100), ("stored/b.nfo", 1)]).await;
    let expected = TransportCall::SetFilePriority {
        content_hash: hash.clone(),
        index: 1,
        priority: FilePriority::DontDownload,
    };
    let (transport, expected) = (&harness.transport, &expected);
    wait_until("priority restored on handle", WAIT, || async move {
        transport.calls().contains(expected).then_some(())
    })
    .await?;
    let record = harness.engine.get(&hash).await?;
    assert_eq!(record.files[1].priority, FilePriority::DontDownload);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn remove_with_data_deletes_payload_without_handle() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let payload = dir.path().join("stored");
    tokio::fs::create_dir_all(&payload).await?;
    tokio::fs::write(payload.join("a.mkv"), b"payload").await?;

    let store = memory_store().await?;
    let mut record = stored_record(11, TorrentState::Stopped, dir.path());
    record.files = vec![FileRecord {
        index: 0,
        path: "stored/a.mkv".into(),
        size_bytes: 7,
        downloaded_bytes: 7,
        priority: FilePriority::Normal,
    }];
    store.upsert(&record).await?;

    let harness = Harness::start_with(ScriptedTransport::new(), store).await?;
    harness
        .engine
        .remove(&record.content_hash, RemoveTorrent { with_data: true })
        .await?;

    assert!(!payload.join("a.mkv").exists());
    assert!(harness.store.get(&record.content_hash).await?.is_none());
    assert!(harness.transport.calls().is_empty());

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pause_forwards_to_live_handle() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = harness.add(12, "Pausable").await?;
    harness
        .emit(TransportNotification::StateChanged {
            handle: harness.transport.handle_for(&hash),
            state: EngineState::Downloading,
        })
        .await;
    harness
        .wait_for(&hash, |record| record.state == TorrentState::Downloading)
        .await?;

    harness.engine.pause(&hash).await?;
    assert_eq!(harness.engine.get(&hash).await?.state, TorrentState::Stopped);
    assert!(harness.transport.calls().contains(&TransportCall::Pause(hash.clone())));
    assert_eq!(
        harness.engine.list_by_state(TorrentState::Stopped).await?.len(),
        1
    );

    harness.engine.resume(&hash).await?;
    assert_eq!(
        harness.engine.get(&hash).await?.state,
        TorrentState::Downloading
    );
    assert!(harness.transport.calls().contains(&TransportCall::Resume(hash.clone())));

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn subscribe_torrent_tracks_one_record() -> Result<()> {
    let harness = Harness::start().await?;
    let hash = sample_hash(13);
    let mut updates = harness.engine.subscribe_torrent(&hash);
    assert!(updates.borrow().is_none());

    harness.add(13, "Watched").await?;
    tokio::time::timeout(WAIT, updates.wait_for(Option::is_some)).await??;

    harness.engine.remove(&hash, RemoveTorrent::default()).await?;
    tokio::time::timeout(WAIT, updates.wait_for(Option::is_none)).await??;

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn invalid_sources_are_rejected() -> Result<()> {
    let harness = Harness::start().await?;
    let err = harness
        .engine
        .add("https://example.invalid/file.torrent", &harness.save_path("x"))
        .await
        .expect_err("non-magnet source");
    assert!(matches!(err, TorrentError::InvalidSource { .. }));
    assert_eq!(harness.engine.count().await?, 0);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn stopped_transport_is_unavailable() -> Result<()> {
    let harness = Harness::start().await?;
    harness.transport.shutdown().await?;

    let hash = sample_hash(14);
    let err = harness
        .engine
        .add(&magnet_uri(&hash, None), &harness.save_path("x"))
        .await
        .expect_err("transport stopped");
    assert!(matches!(err, TorrentError::TransportUnavailable { .. }));
    assert!(harness.store.get(&hash).await?.is_none());

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn rejected_add_leaves_no_record() -> Result<()> {
    let harness = Harness::start().await?;
    harness.transport.fail("add");
    let hash = sample_hash(15);
    let err = harness
        .engine
        .add(&magnet_uri(&hash, None), &harness.save_path("x"))
        .await
        .expect_err("scripted add failure");
    assert!(matches!(err, TorrentError::Transport { .. }));
    assert!(harness.store.get(&hash).await?.is_none());

    harness.transport.heal("add");
    harness.add(15, "Retry").await?;
    assert_eq!(harness.engine.count().await?, 1);

    harness.engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_is_idempotent() -> Result<()> {
    let harness = Harness::start().await?;
    harness.engine.shutdown().await?;
    harness.engine.shutdown().await?;
    let shutdowns = harness
        .transport
        .calls()
        .into_iter()
        .filter(|call| *call == TransportCall::Shutdown)
        .count();
    assert_eq!(shutdowns, 1);
    Ok(())
}

#[tokio::test]
async fn notification_stream_has_a_single_consumer() -> Result<()> {
    let transport = Arc::new(ScriptedTransport::new());
    let _claimed = transport.take_notifications();
    let store = memory_store().await?;
    let result = SessionEngine::init(SessionDeps {
        transport,
        store: Arc::new(store),
        keepalive: Arc::new(RecordingKeepalive::new()),
        events: EventBus::new(),
        metrics: Metrics::new()?,
        options: SessionOptions::default(),
    })
    .await;
    assert!(matches!(
        result,
        Err(TorrentError::TransportUnavailable { .. })
    ));
    Ok(())
}
