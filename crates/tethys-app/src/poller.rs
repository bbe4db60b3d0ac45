//! Fixed-interval sampler of transfer counters for live handles.

use std::sync::Arc;
use std::time::Duration;

use tethys_telemetry::Metrics;
use tethys_torrent_core::{TorrentPatch, TorrentStore, TransportEngine};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::registry::HandleRegistry;

pub(crate) struct StatsPoller {
    store: Arc<dyn TorrentStore>,
    transport: Arc<dyn TransportEngine>,
    registry: Arc<HandleRegistry>,
    metrics: Metrics,
    interval: Duration,
}

impl StatsPoller {
    pub(crate) const fn new(
        store: Arc<dyn TorrentStore>,
        transport: Arc<dyn TransportEngine>,
        registry: Arc<HandleRegistry>,
        metrics: Metrics,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            registry,
            metrics,
            interval,
        }
    }

    pub(crate) fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => self.poll_once().await,
                }
            }
            debug!("stats poller stopped");
        })
    }

    /// Sample every live handle once. Failures are per handle and never stop
    /// the sweep.
    pub(crate) async fn poll_once(&self) {
        for handle in self.registry.live_handles().await {
            let stats = match self.transport.poll_status(&handle).await {
                Ok(stats) => stats,
                Err(err) => {
                    self.metrics.inc_poll_failure();
                    debug!(
                        error = %err,
                        content_hash = %handle.content_hash,
                        "transfer status unavailable"
                    );
                    continue;
                }
            };

            let patch = TorrentPatch::from_stats(&stats);
            match self.store.update_fields(&handle.content_hash, &patch).await {
                Ok(true) => {}
                Ok(false) => debug!(
                    content_hash = %handle.content_hash,
                    "skipping transfer status for removed torrent"
                ),
                Err(err) => {
                    self.metrics.inc_store_failure("poller");
                    warn!(
                        error = %err,
                        content_hash = %handle.content_hash,
                        "failed to persist transfer status"
                    );
                }
            }
        }
    }
}
