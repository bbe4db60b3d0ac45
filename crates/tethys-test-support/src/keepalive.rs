//! Keepalive sink that records every signal it receives.

use std::sync::{Arc, Mutex};

use tethys_torrent_core::{KeepaliveSignal, KeepaliveSink};

/// [`KeepaliveSink`] capturing signals for later assertions.
#[derive(Debug, Clone, Default)]
pub struct RecordingKeepalive {
    signals: Arc<Mutex<Vec<KeepaliveSignal>>>,
}

impl RecordingKeepalive {
    /// Empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals received so far, oldest first.
    #[must_use]
    pub fn signals(&self) -> Vec<KeepaliveSignal> {
        self.signals
            .lock()
            .map(|signals| signals.clone())
            .unwrap_or_default()
    }

    /// Most recent signal, if any.
    #[must_use]
    pub fn last(&self) -> Option<KeepaliveSignal> {
        self.signals().last().copied()
    }
}

impl KeepaliveSink for RecordingKeepalive {
    fn signal(&self, signal: KeepaliveSignal) {
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(signal);
        }
    }
}
