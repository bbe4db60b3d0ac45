//! Row decoding and column encoding helpers.

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tethys_events::TorrentState;
use tethys_torrent_core::{ContentHash, FileRecord, TorrentRecord};

pub(crate) const fn serialize_state(state: TorrentState) -> &'static str {
    state.as_str()
}

pub(crate) fn deserialize_state(label: &str) -> TorrentState {
    TorrentState::from_label(label).unwrap_or_else(|| {
        tracing::warn!(state = %label, "unknown torrent state encountered in runtime store");
        TorrentState::Stopped
    })
}

pub(crate) fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

pub(crate) fn encode_files(files: &[FileRecord]) -> Result<String> {
    serde_json::to_string(files).context("failed to serialise torrent file list")
}

pub(crate) fn decode_files(raw: &str) -> Result<Vec<FileRecord>> {
    serde_json::from_str(raw).context("failed to decode persisted torrent file list")
}

pub(crate) fn encode_trackers(trackers: &[String]) -> Result<String> {
    serde_json::to_string(trackers).context("failed to serialise tracker list")
}

pub(crate) fn decode_record(row: &SqliteRow) -> Result<TorrentRecord> {
    let hash: String = row.try_get("content_hash")?;
    let content_hash = ContentHash::from_hex(&hash)
        .with_context(|| format!("persisted content hash {hash} is malformed"))?;
    let state: String = row.try_get("state")?;
    let files: String = row.try_get("files")?;
    let trackers: String = row.try_get("trackers")?;

    Ok(TorrentRecord {
        content_hash,
        source_uri: row.try_get("source_uri")?,
        display_name: row.try_get("display_name")?,
        save_path: row.try_get("save_path")?,
        total_size: to_u64(row.try_get("total_size")?),
        downloaded_size: to_u64(row.try_get("downloaded_size")?),
        uploaded_size: to_u64(row.try_get("uploaded_size")?),
        download_rate: to_u64(row.try_get("download_rate")?),
        upload_rate: to_u64(row.try_get("upload_rate")?),
        progress: row.try_get("progress")?,
        num_peers: to_u32(row.try_get("num_peers")?),
        num_seeds: to_u32(row.try_get("num_seeds")?),
        state: deserialize_state(&state),
        files: decode_files(&files)?,
        added_at: row.try_get("added_at")?,
        finished_at: row.try_get("finished_at")?,
        last_error: row.try_get("last_error")?,
        sequential_download: row.try_get("sequential_download")?,
        is_private: row.try_get("is_private")?,
        creator: row.try_get("creator")?,
        comment: row.try_get("comment")?,
        trackers: serde_json::from_str(&trackers).context("failed to decode tracker list")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_state_serialisation() {
        for state in TorrentState::ALL {
            assert_eq!(deserialize_state(serialize_state(state)), state);
        }
        assert_eq!(deserialize_state("fetching_metadata"), TorrentState::Stopped);
    }

    #[test]
    fn clamp_handles_large_values() {
        assert_eq!(clamp_i64(42), 42);
        assert_eq!(clamp_i64(u64::MAX), i64::MAX);
        assert_eq!(to_u64(-5), 0);
        assert_eq!(to_u32(i64::MAX), u32::MAX);
    }
}
