//! Keepalive sink for headless runs.

use tethys_torrent_core::{KeepaliveSignal, KeepaliveSink};
use tracing::info;

/// [`KeepaliveSink`] that only records transitions in the log.
///
/// The headless binary is kept alive by its own signal handler, so there is
/// nothing else to hold open.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingKeepalive;

impl KeepaliveSink for TracingKeepalive {
    fn signal(&self, signal: KeepaliveSignal) {
        match signal {
            KeepaliveSignal::Start { active } => info!(active, "background work started"),
            KeepaliveSignal::Stop => info!("background work finished"),
        }
    }
}
