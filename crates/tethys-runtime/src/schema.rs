//! Table layout for the torrent catalogue.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

/// Idempotent schema; applied on every connect.
const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS torrents (
        content_hash        TEXT PRIMARY KEY NOT NULL,
        source_uri          TEXT NOT NULL,
        display_name        TEXT NOT NULL,
        save_path           TEXT NOT NULL,
        total_size          INTEGER NOT NULL DEFAULT 0,
        downloaded_size     INTEGER NOT NULL DEFAULT 0,
        uploaded_size       INTEGER NOT NULL DEFAULT 0,
        download_rate       INTEGER NOT NULL DEFAULT 0,
        upload_rate         INTEGER NOT NULL DEFAULT 0,
        progress            REAL NOT NULL DEFAULT 0,
        num_peers           INTEGER NOT NULL DEFAULT 0,
        num_seeds           INTEGER NOT NULL DEFAULT 0,
        state               TEXT NOT NULL,
        files               TEXT NOT NULL DEFAULT '[]',
        added_at            TEXT NOT NULL,
        finished_at         TEXT,
        last_error          TEXT,
        sequential_download INTEGER NOT NULL DEFAULT 0,
        is_private          INTEGER NOT NULL DEFAULT 0,
        creator             TEXT,
        comment             TEXT,
        trackers            TEXT NOT NULL DEFAULT '[]'
    );

    CREATE INDEX IF NOT EXISTS torrents_state_idx ON torrents(state);
    CREATE INDEX IF NOT EXISTS torrents_added_at_idx ON torrents(added_at);
";

pub(crate) async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to apply torrent catalogue schema")?;
    Ok(())
}
