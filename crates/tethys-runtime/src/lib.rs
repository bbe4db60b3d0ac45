#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Durable torrent catalogue backed by SQLite.
//!
//! # Design
//! - One row per content hash. File and tracker lists live in JSON text columns.
//! - Every write is serialised through a single async write gate. Field
//!   updates are single `UPDATE` statements naming only the patched columns,
//!   so two writers touching disjoint fields of one record never lose each
//!   other's values.
//! - After each committed write the touched row is re-read and patched into
//!   the snapshot published on a `watch` channel; subscribers see snapshots in
//!   commit order.
//! - A row that no longer decodes is logged, counted and left out of listings
//!   so the rest of the catalogue stays readable.

mod row;
mod schema;

use std::cmp::Ordering as CmpOrdering;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tethys_events::TorrentState;
use tethys_torrent_core::{
    ContentHash, FilePriorityOverride, TorrentError, TorrentPatch, TorrentRecord, TorrentResult,
    TorrentSnapshot, TorrentStore,
};
use tokio::sync::{Mutex, watch};
use tracing::warn;

use crate::row::{
    clamp_i64, decode_files, decode_record, encode_files, encode_trackers, serialize_state,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POOL_CONNECTIONS: u32 = 4;

const UPSERT_TORRENT_SQL: &str = r"
    INSERT INTO torrents (
        content_hash,
        source_uri,
        display_name,
        save_path,
        total_size,
        downloaded_size,
        uploaded_size,
        download_rate,
        upload_rate,
        progress,
        num_peers,
        num_seeds,
        state,
        files,
        added_at,
        finished_at,
        last_error,
        sequential_download,
        is_private,
        creator,
        comment,
        trackers
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (content_hash) DO UPDATE
    SET
        source_uri = excluded.source_uri,
        display_name = excluded.display_name,
        save_path = excluded.save_path,
        total_size = excluded.total_size,
        downloaded_size = excluded.downloaded_size,
        uploaded_size = excluded.uploaded_size,
        download_rate = excluded.download_rate,
        upload_rate = excluded.upload_rate,
        progress = excluded.progress,
        num_peers = excluded.num_peers,
        num_seeds = excluded.num_seeds,
        state = excluded.state,
        files = excluded.files,
        added_at = excluded.added_at,
        finished_at = excluded.finished_at,
        last_error = excluded.last_error,
        sequential_download = excluded.sequential_download,
        is_private = excluded.is_private,
        creator = excluded.creator,
        comment = excluded.comment,
        trackers = excluded.trackers
";

const SELECT_TORRENTS_SQL: &str = r"
    SELECT * FROM torrents
    ORDER BY added_at DESC, content_hash ASC
";

const SELECT_TORRENT_SQL: &str = r"
    SELECT * FROM torrents
    WHERE content_hash = ?
";

const SELECT_FILES_SQL: &str = r"
    SELECT files FROM torrents
    WHERE content_hash = ?
";

const UPDATE_FILES_SQL: &str = r"
    UPDATE torrents
    SET files = ?
    WHERE content_hash = ?
";

const DELETE_TORRENT_SQL: &str = r"
    DELETE FROM torrents
    WHERE content_hash = ?
";

const DELETE_ALL_SQL: &str = r"
    DELETE FROM torrents
";

const COUNT_TORRENTS_SQL: &str = r"
    SELECT COUNT(*) FROM torrents
";

/// SQLite-backed repository for torrent records.
#[derive(Clone)]
pub struct RuntimeStore {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
    changes: Arc<watch::Sender<TorrentSnapshot>>,
    skipped_rows: Arc<AtomicU64>,
}

impl RuntimeStore {
    /// Open (creating if missing) the database at `url` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is malformed, the database cannot be
    /// opened, or the schema cannot be applied.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid sqlite url {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .context("failed to open torrent catalogue")?;
        Self::new(pool).await
    }

    /// Open a private in-memory database, mostly useful for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema setup fails.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory sqlite url")?;
        // A memory database lives exactly as long as its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory torrent catalogue")?;
        Self::new(pool).await
    }

    /// Wrap an existing pool, applying the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied or the initial
    /// snapshot cannot be loaded.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        schema::apply(&pool).await?;
        let skipped_rows = Arc::new(AtomicU64::new(0));
        let initial = load_all(&pool, &skipped_rows).await?;
        let (changes, _) = watch::channel(Arc::new(initial));
        Ok(Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
            changes: Arc::new(changes),
            skipped_rows,
        })
    }

    /// Number of rows skipped so far because they could not be decoded.
    #[must_use]
    pub fn skipped_rows(&self) -> u64 {
        self.skipped_rows.load(Ordering::Relaxed)
    }

    /// Access the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Delete every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn delete_all(&self) -> Result<u64> {
        let _gate = self.write_gate.lock().await;
        let result = sqlx::query(DELETE_ALL_SQL)
            .execute(&self.pool)
            .await
            .context("failed to clear torrent catalogue")?;
        self.publish_all().await;
        Ok(result.rows_affected())
    }

    /// Close the pool, waiting for connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn upsert_record(&self, record: &TorrentRecord) -> Result<()> {
        let files = encode_files(&record.files)?;
        let trackers = encode_trackers(&record.trackers)?;

        let _gate = self.write_gate.lock().await;
        sqlx::query(UPSERT_TORRENT_SQL)
            .bind(record.content_hash.as_str())
            .bind(&record.source_uri)
            .bind(&record.display_name)
            .bind(&record.save_path)
            .bind(clamp_i64(record.total_size))
            .bind(clamp_i64(record.downloaded_size))
            .bind(clamp_i64(record.uploaded_size))
            .bind(clamp_i64(record.download_rate))
            .bind(clamp_i64(record.upload_rate))
            .bind(record.progress)
            .bind(i64::from(record.num_peers))
            .bind(i64::from(record.num_seeds))
            .bind(serialize_state(record.state))
            .bind(files)
            .bind(record.added_at)
            .bind(record.finished_at)
            .bind(record.last_error.as_deref())
            .bind(record.sequential_download)
            .bind(record.is_private)
            .bind(record.creator.as_deref())
            .bind(record.comment.as_deref())
            .bind(trackers)
            .execute(&self.pool)
            .await
            .context("failed to upsert torrent record")?;
        self.publish(&record.content_hash).await;
        Ok(())
    }

    async fn fetch(&self, content_hash: &ContentHash) -> Result<Option<TorrentRecord>> {
        let row = sqlx::query(SELECT_TORRENT_SQL)
            .bind(content_hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("failed to load torrent record")?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn apply_patch(&self, content_hash: &ContentHash, patch: &TorrentPatch) -> Result<bool> {
        if patch.is_empty() {
            return Ok(self.fetch(content_hash).await?.is_some());
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE torrents SET ");
        push_assignments(&mut builder, patch)?;
        builder.push(" WHERE content_hash = ");
        builder.push_bind(content_hash.as_str().to_owned());

        let _gate = self.write_gate.lock().await;
        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .context("failed to update torrent fields")?;
        let updated = result.rows_affected() > 0;
        if updated {
            self.publish(content_hash).await;
        }
        Ok(updated)
    }

    async fn rewrite_priorities(
        &self,
        content_hash: &ContentHash,
        changes: &[FilePriorityOverride],
    ) -> Result<bool> {
        let _gate = self.write_gate.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open priority transaction")?;

        let raw: Option<String> = sqlx::query_scalar(SELECT_FILES_SQL)
            .bind(content_hash.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context("failed to load torrent files")?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut files = decode_files(&raw)?;
        for change in changes {
            match files.iter_mut().find(|file| file.index == change.index) {
                Some(file) => file.priority = change.priority,
                None => warn!(
                    content_hash = %content_hash,
                    file_index = change.index,
                    "ignoring priority change for unknown file index"
                ),
            }
        }

        sqlx::query(UPDATE_FILES_SQL)
            .bind(encode_files(&files)?)
            .bind(content_hash.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to persist torrent files")?;
        tx.commit()
            .await
            .context("failed to commit priority transaction")?;

        self.publish(content_hash).await;
        Ok(true)
    }

    async fn delete_record(&self, content_hash: &ContentHash) -> Result<bool> {
        let _gate = self.write_gate.lock().await;
        let result = sqlx::query(DELETE_TORRENT_SQL)
            .bind(content_hash.as_str())
            .execute(&self.pool)
            .await
            .context("failed to remove torrent from catalogue")?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.publish(content_hash).await;
        }
        Ok(deleted)
    }

    async fn filter_states(&self, states: &[TorrentState]) -> Result<Vec<TorrentRecord>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM torrents WHERE state IN (");
        {
            let mut labels = builder.separated(", ");
            for state in states {
                labels.push_bind(serialize_state(*state));
            }
        }
        builder.push(") ORDER BY added_at DESC, content_hash ASC");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to filter torrent catalogue")?;
        Ok(decode_rows(&rows, &self.skipped_rows))
    }

    /// Re-read one record and patch it into the published snapshot. Must run
    /// with the write gate held so snapshots follow commit order.
    async fn publish(&self, content_hash: &ContentHash) {
        let current = match self.fetch(content_hash).await {
            Ok(current) => current,
            Err(err) => {
                self.skipped_rows.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %err,
                    content_hash = %content_hash,
                    "failed to reload torrent record; dropping it from the snapshot"
                );
                None
            }
        };
        self.changes.send_modify(|snapshot| {
            let mut records = snapshot.as_ref().clone();
            let position = records
                .iter()
                .position(|record| &record.content_hash == content_hash);
            match (position, current) {
                (Some(index), Some(record)) if records[index].added_at == record.added_at => {
                    records[index] = record;
                }
                (position, current) => {
                    if let Some(index) = position {
                        records.remove(index);
                    }
                    if let Some(record) = current {
                        let index = records
                            .binary_search_by(|existing| catalogue_order(existing, &record))
                            .unwrap_or_else(|index| index);
                        records.insert(index, record);
                    }
                }
            }
            *snapshot = Arc::new(records);
        });
    }

    /// Re-read the whole catalogue and push it to subscribers.
    async fn publish_all(&self) {
        match load_all(&self.pool, &self.skipped_rows).await {
            Ok(records) => {
                self.changes.send_replace(Arc::new(records));
            }
            Err(err) => warn!(error = %err, "failed to publish torrent catalogue snapshot"),
        }
    }
}

async fn load_all(pool: &SqlitePool, skipped: &AtomicU64) -> Result<Vec<TorrentRecord>> {
    let rows = sqlx::query(SELECT_TORRENTS_SQL)
        .fetch_all(pool)
        .await
        .context("failed to load torrent catalogue")?;
    Ok(decode_rows(&rows, skipped))
}

fn decode_rows(rows: &[SqliteRow], skipped: &AtomicU64) -> Vec<TorrentRecord> {
    rows.iter()
        .filter_map(|row| match decode_record(row) {
            Ok(record) => Some(record),
            Err(err) => {
                skipped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "skipping undecodable torrent row");
                None
            }
        })
        .collect()
}

/// Listing order: newest first, ties broken by content hash.
fn catalogue_order(left: &TorrentRecord, right: &TorrentRecord) -> CmpOrdering {
    right
        .added_at
        .cmp(&left.added_at)
        .then_with(|| left.content_hash.cmp(&right.content_hash))
}

fn push_assignments(builder: &mut QueryBuilder<'_, Sqlite>, patch: &TorrentPatch) -> Result<()> {
    let mut set = builder.separated(", ");
    if let Some(state) = patch.state {
        set.push("state = ").push_bind_unseparated(serialize_state(state));
    }
    if let Some(name) = &patch.display_name {
        set.push("display_name = ").push_bind_unseparated(name.clone());
    }
    if let Some(total_size) = patch.total_size {
        set.push("total_size = ").push_bind_unseparated(clamp_i64(total_size));
    }
    if let Some(files) = &patch.files {
        set.push("files = ").push_bind_unseparated(encode_files(files)?);
    }
    if let Some(last_error) = &patch.last_error {
        set.push("last_error = ").push_bind_unseparated(last_error.clone());
    }
    if let Some(finished_at) = patch.finished_at {
        set.push("finished_at = ").push_bind_unseparated(finished_at);
    }
    if let Some(sequential) = patch.sequential_download {
        set.push("sequential_download = ").push_bind_unseparated(sequential);
    }
    if let Some(is_private) = patch.is_private {
        set.push("is_private = ").push_bind_unseparated(is_private);
    }
    if let Some(creator) = &patch.creator {
        set.push("creator = ").push_bind_unseparated(creator.clone());
    }
    if let Some(comment) = &patch.comment {
        set.push("comment = ").push_bind_unseparated(comment.clone());
    }
    if let Some(trackers) = &patch.trackers {
        set.push("trackers = ").push_bind_unseparated(encode_trackers(trackers)?);
    }
    if let Some(progress) = patch.progress {
        set.push("progress = ").push_bind_unseparated(progress);
    }
    if let Some(value) = patch.downloaded_size {
        set.push("downloaded_size = ").push_bind_unseparated(clamp_i64(value));
    }
    if let Some(value) = patch.uploaded_size {
        set.push("uploaded_size = ").push_bind_unseparated(clamp_i64(value));
    }
    if let Some(value) = patch.download_rate {
        set.push("download_rate = ").push_bind_unseparated(clamp_i64(value));
    }
    if let Some(value) = patch.upload_rate {
        set.push("upload_rate = ").push_bind_unseparated(clamp_i64(value));
    }
    if let Some(value) = patch.num_peers {
        set.push("num_peers = ").push_bind_unseparated(i64::from(value));
    }
    if let Some(value) = patch.num_seeds {
        set.push("num_seeds = ").push_bind_unseparated(i64::from(value));
    }
    Ok(())
}

#[async_trait]
impl TorrentStore for RuntimeStore {
    async fn upsert(&self, record: &TorrentRecord) -> TorrentResult<()> {
        self.upsert_record(record)
            .await
            .map_err(|err| store_error("upsert", err))
    }

    async fn get(&self, content_hash: &ContentHash) -> TorrentResult<Option<TorrentRecord>> {
        self.fetch(content_hash)
            .await
            .map_err(|err| store_error("get", err))
    }

    async fn list_all(&self) -> TorrentResult<Vec<TorrentRecord>> {
        load_all(&self.pool, &self.skipped_rows)
            .await
            .map_err(|err| store_error("list_all", err))
    }

    async fn list_where(&self, states: &[TorrentState]) -> TorrentResult<Vec<TorrentRecord>> {
        self.filter_states(states)
            .await
            .map_err(|err| store_error("list_where", err))
    }

    async fn update_fields(
        &self,
        content_hash: &ContentHash,
        patch: &TorrentPatch,
    ) -> TorrentResult<bool> {
        self.apply_patch(content_hash, patch)
            .await
            .map_err(|err| store_error("update_fields", err))
    }

    async fn set_file_priorities(
        &self,
        content_hash: &ContentHash,
        changes: &[FilePriorityOverride],
    ) -> TorrentResult<bool> {
        self.rewrite_priorities(content_hash, changes)
            .await
            .map_err(|err| store_error("set_file_priorities", err))
    }

    async fn delete(&self, content_hash: &ContentHash) -> TorrentResult<bool> {
        self.delete_record(content_hash)
            .await
            .map_err(|err| store_error("delete", err))
    }

    async fn count(&self) -> TorrentResult<usize> {
        let count: i64 = sqlx::query_scalar(COUNT_TORRENTS_SQL)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| TorrentError::store("count", err))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn subscribe_all(&self) -> watch::Receiver<TorrentSnapshot> {
        self.changes.subscribe()
    }
}

fn store_error(operation: &'static str, err: anyhow::Error) -> TorrentError {
    TorrentError::Store {
        operation,
        source: err.into(),
    }
}
