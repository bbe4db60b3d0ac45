//! Aggregate counters across the whole catalogue.

use serde::{Deserialize, Serialize};

use super::{TorrentRecord, TorrentState};

/// Session-wide rollup of every persisted record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentStats {
    pub total: usize,
    pub active: usize,
    pub downloading: usize,
    pub seeding: usize,
    pub paused: usize,
    pub total_download_rate: u64,
    pub total_upload_rate: u64,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
}

impl TorrentStats {
    /// Fold a record set into aggregate counters.
    #[must_use]
    pub fn from_records(records: &[TorrentRecord]) -> Self {
        records.iter().fold(Self::default(), |mut stats, record| {
            stats.total += 1;
            if record.is_active() {
                stats.active += 1;
            }
            match record.state {
                TorrentState::Downloading | TorrentState::MetadataDownloading => {
                    stats.downloading += 1;
                }
                TorrentState::Seeding => stats.seeding += 1,
                TorrentState::Stopped => stats.paused += 1,
                _ => {}
            }
            stats.total_download_rate = stats.total_download_rate.saturating_add(record.download_rate);
            stats.total_upload_rate = stats.total_upload_rate.saturating_add(record.upload_rate);
            stats.total_downloaded = stats.total_downloaded.saturating_add(record.downloaded_size);
            stats.total_uploaded = stats.total_uploaded.saturating_add(record.uploaded_size);
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContentHash;

    #[test]
    fn aggregates_counts_and_rates() {
        let states = [
            TorrentState::Downloading,
            TorrentState::Seeding,
            TorrentState::Stopped,
            TorrentState::Finished,
        ];
        let records: Vec<TorrentRecord> = states
            .iter()
            .enumerate()
            .map(|(index, state)| {
                let hash = ContentHash::from_hex(&format!("{index:040x}")).expect("hash");
                let mut record = TorrentRecord::new(hash, "magnet:?", None, "/tmp");
                record.state = *state;
                record.download_rate = 10;
                record.uploaded_size = 5;
                record
            })
            .collect();

        let stats = TorrentStats::from_records(&records);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.downloading, 1);
        assert_eq!(stats.seeding, 1);
        assert_eq!(stats.paused, 1);
        assert_eq!(stats.total_download_rate, 40);
        assert_eq!(stats.total_uploaded, 20);
    }
}
