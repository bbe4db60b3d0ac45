//! Deterministic fixtures for torrents and stores.

use anyhow::Result;
use tethys_runtime::RuntimeStore;
use tethys_torrent_core::{ContentHash, MetadataFile, TorrentMetadata};

/// Content hash made of `seed` repeated over twenty bytes.
#[must_use]
pub fn sample_hash(seed: u8) -> ContentHash {
    ContentHash::from_bytes(&[seed; 20])
}

/// Magnet link for `content_hash`, carrying `name` as its display hint when given.
#[must_use]
pub fn magnet_uri(content_hash: &ContentHash, name: Option<&str>) -> String {
    match name {
        Some(name) => format!(
            "magnet:?xt=urn:btih:{content_hash}&dn={}",
            name.replace(' ', "+")
        ),
        None => format!("magnet:?xt=urn:btih:{content_hash}"),
    }
}

/// Metadata named `name` with one file per `(path, size)` entry.
#[must_use]
pub fn sample_metadata(name: &str, files: &[(&str, u64)]) -> TorrentMetadata {
    TorrentMetadata {
        name: name.to_string(),
        files: files
            .iter()
            .map(|(path, size_bytes)| MetadataFile {
                path: (*path).to_string(),
                size_bytes: *size_bytes,
            })
            .collect(),
        ..TorrentMetadata::default()
    }
}

/// Fresh single-connection `SQLite` store living in memory.
///
/// # Errors
///
/// Returns an error when the pool cannot be opened or migrated.
pub async fn memory_store() -> Result<RuntimeStore> {
    RuntimeStore::in_memory().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_hash_is_stable_hex() {
        assert_eq!(sample_hash(0xab).as_str(), "ab".repeat(20));
        assert_ne!(sample_hash(1), sample_hash(2));
    }

    #[test]
    fn magnet_uri_round_trips_through_parser() -> Result<()> {
        let hash = sample_hash(7);
        let parsed = tethys_transport::source::parse_magnet(&magnet_uri(&hash, Some("Big Movie")))?;
        assert_eq!(parsed.content_hash, hash);
        assert_eq!(parsed.display_name.as_deref(), Some("Big Movie"));
        Ok(())
    }

    #[test]
    fn sample_metadata_sums_sizes() {
        let metadata = sample_metadata("pack", &[("a.mkv", 100), ("b.srt", 50)]);
        assert_eq!(metadata.total_size(), 150);
        assert_eq!(metadata.files[1].path, "b.srt");
    }
}
