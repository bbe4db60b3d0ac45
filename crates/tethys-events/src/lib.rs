//! Domain event bus for the Tethys session engine.
//!
//! The bus carries typed notices about the torrent catalogue (additions,
//! removals, state transitions, keepalive changes) to any number of
//! subscribers. Identifiers are sequential so a reconnecting subscriber can ask
//! for everything newer than the last id it saw; a bounded replay ring backs
//! that request. Internally it uses `tokio::broadcast`; when the channel
//! overflows the oldest events are dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};

/// Identifier assigned to each event emitted by the session.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TorrentAdded {
        content_hash: String,
        name: String,
    },
    FilesDiscovered {
        content_hash: String,
        files: Vec<DiscoveredFile>,
    },
    StateChanged {
        content_hash: String,
        state: TorrentState,
    },
    Completed {
        content_hash: String,
    },
    TorrentRemoved {
        content_hash: String,
        with_data: bool,
    },
    KeepaliveChanged {
        active: bool,
        active_torrents: usize,
    },
    HealthChanged {
        degraded: Vec<String>,
    },
}

impl Event {
    /// Machine-friendly discriminator for subscribers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TorrentAdded { .. } => "torrent_added",
            Self::FilesDiscovered { .. } => "files_discovered",
            Self::StateChanged { .. } => "state_changed",
            Self::Completed { .. } => "completed",
            Self::TorrentRemoved { .. } => "torrent_removed",
            Self::KeepaliveChanged { .. } => "keepalive_changed",
            Self::HealthChanged { .. } => "health_changed",
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

/// Individual file discovered once torrent metadata resolves.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub index: u32,
    pub path: String,
    pub size_bytes: u64,
}

/// Lifecycle states a persisted torrent record moves through.
///
/// `Finished` and `Error` are stable but re-enterable: a paused finished torrent
/// returns to `Stopped`, and a retried resume clears an error.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    Stopped,
    Queued,
    MetadataDownloading,
    Checking,
    Downloading,
    Seeding,
    Finished,
    Error,
}

impl TorrentState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Stopped,
        Self::Queued,
        Self::MetadataDownloading,
        Self::Checking,
        Self::Downloading,
        Self::Seeding,
        Self::Finished,
        Self::Error,
    ];

    /// States that keep background work alive and are re-admitted on restart.
    pub const ACTIVE: [Self; 3] = [
        Self::Downloading,
        Self::Seeding,
        Self::MetadataDownloading,
    ];

    /// Whether the state belongs to the active set.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::Seeding | Self::MetadataDownloading
        )
    }

    /// Stable storage label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Queued => "queued",
            Self::MetadataDownloading => "metadata_downloading",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Finished => "finished",
            Self::Error => "error",
        }
    }

    /// Parse a storage label produced by [`TorrentState::as_str`].
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == label)
    }
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, so dropped events impact both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.buffer.lock().expect("event buffer mutex poisoned");
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.buffer.lock().expect("event buffer mutex poisoned");
            backlog.extend(buffer.iter().filter(|item| item.id > since).cloned());
        }

        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Returns the last assigned identifier, if any events have been published.
    ///
    /// # Panics
    ///
    /// Panics if the replay buffer mutex has been poisoned.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.buffer.lock().expect("event buffer mutex poisoned");
        buffer.back().map(|event| event.id)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from the
/// live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::task;
    use tokio::time::timeout;

    const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

    fn sample_state_event(id: usize) -> Event {
        Event::StateChanged {
            content_hash: format!("{id:040x}"),
            state: TorrentState::Downloading,
        }
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_state_event(i));
        }
        assert_eq!(last_id, 5);
        assert_eq!(bus.last_event_id(), Some(5));

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(event) = stream.next().await {
                received.push(event);
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().map(|e| e.id), Some(3));
        assert_eq!(received.last().map(|e| e.id), Some(5));
    }

    #[tokio::test]
    async fn replay_ring_drops_oldest_when_full() {
        let bus = EventBus::with_capacity(4);
        for i in 0..6 {
            bus.publish(sample_state_event(i));
        }

        let mut stream = bus.subscribe(Some(0));
        let first = stream.next().await.expect("backlog entry");
        assert_eq!(first.id, 3);
    }

    #[tokio::test]
    async fn load_test_does_not_stall_publishers() {
        let bus = Arc::new(EventBus::with_capacity(512));
        let mut stream = bus.subscribe(None);

        let publisher = {
            let bus = bus.clone();
            task::spawn(async move {
                for i in 0..500 {
                    let publish_bus = bus.clone();
                    timeout(PUBLISH_TIMEOUT, async move {
                        publish_bus.publish(sample_state_event(i));
                    })
                    .await
                    .expect("publish timed out");
                }
            })
        };

        let consumer = task::spawn(async move {
            let mut ids = HashSet::new();
            while ids.len() < 500 {
                if let Some(event) = stream.next().await {
                    ids.insert(event.id);
                }
            }
            ids
        });

        publisher.await.expect("publisher task panicked");
        let ids = consumer.await.expect("consumer task panicked");
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn state_labels_round_trip_and_active_set() {
        for state in TorrentState::ALL {
            assert_eq!(TorrentState::from_label(state.as_str()), Some(state));
            assert_eq!(state.is_active(), TorrentState::ACTIVE.contains(&state));
        }
        assert_eq!(TorrentState::from_label("paused"), None);
    }

    #[test]
    fn event_kind_is_tagged_in_json() {
        let event = Event::KeepaliveChanged {
            active: true,
            active_torrents: 2,
        };
        let json = serde_json::to_value(&event).expect("serialise event");
        assert_eq!(json["type"], event.kind());
        assert_eq!(json["active_torrents"], 2);
    }
}
