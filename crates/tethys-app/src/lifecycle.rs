//! Keepalive controller driven by the persisted record set.
//!
//! # Design
//! - Observes the store's snapshot feed, not the handle registry, so the
//!   signal is right immediately after recovery.
//! - Signals only on edges: zero to some active records raises the keepalive,
//!   some to zero lowers it.

use std::sync::Arc;

use tethys_events::{Event, EventBus};
use tethys_telemetry::Metrics;
use tethys_torrent_core::{KeepaliveSignal, KeepaliveSink, TorrentRecord, TorrentSnapshot};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub(crate) struct LifecycleController {
    sink: Arc<dyn KeepaliveSink>,
    events: EventBus,
    metrics: Metrics,
    raised: bool,
}

impl LifecycleController {
    pub(crate) const fn new(sink: Arc<dyn KeepaliveSink>, events: EventBus, metrics: Metrics) -> Self {
        Self {
            sink,
            events,
            metrics,
            raised: false,
        }
    }

    pub(crate) fn spawn(
        mut self,
        mut changes: watch::Receiver<TorrentSnapshot>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let initial = changes.borrow_and_update().clone();
            self.observe(&initial);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = changes.borrow_and_update().clone();
                        self.observe(&snapshot);
                    }
                }
            }
            if self.raised {
                self.lower();
            }
            debug!("lifecycle controller stopped");
        })
    }

    pub(crate) fn observe(&mut self, records: &[TorrentRecord]) {
        let active = records.iter().filter(|record| record.is_active()).count();
        self.metrics.set_active_torrents(active);
        match (self.raised, active > 0) {
            (false, true) => {
                self.raised = true;
                info!(active, "keepalive raised");
                self.sink.signal(KeepaliveSignal::Start { active });
                self.announce(active);
            }
            (true, false) => self.lower(),
            _ => {}
        }
    }

    fn lower(&mut self) {
        self.raised = false;
        info!("keepalive lowered");
        self.sink.signal(KeepaliveSignal::Stop);
        self.announce(0);
    }

    fn announce(&self, active: usize) {
        self.metrics.set_keepalive(self.raised);
        self.events.publish(Event::KeepaliveChanged {
            active: self.raised,
            active_torrents: active,
        });
    }
}
