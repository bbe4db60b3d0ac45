//! In-memory ownership of live transport handles.
//!
//! # Design
//! - One slot per content hash. A slot is reserved before the transport is
//!   asked to add the torrent and becomes live when the first notification
//!   carrying its handle arrives.
//! - Lookups hand out clones; nobody outside the registry holds a reference
//!   into the map.

use std::collections::HashMap;

use tethys_torrent_core::{ContentHash, TorrentHandle};
use tokio::sync::RwLock;

/// Registration state of one content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandleSlot {
    /// Admission issued; the engine has not announced a handle yet.
    Pending,
    /// Handle announced by the engine.
    Live(TorrentHandle),
}

/// Result of attaching an announced handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttachOutcome {
    /// A pending slot became live.
    Attached,
    /// The slot already held this handle.
    Unchanged,
    /// The engine re-issued the handle; the previous one is returned.
    Replaced(TorrentHandle),
    /// No slot exists for the hash, so nothing was registered.
    Untracked,
    /// The engine refused admission; nothing was registered.
    Rejected,
}

#[derive(Debug, Default)]
pub(crate) struct HandleRegistry {
    slots: RwLock<HashMap<ContentHash, HandleSlot>>,
}

impl HandleRegistry {
    /// Reserve a slot for `content_hash`. Returns `false` when one already exists.
    pub(crate) async fn reserve(&self, content_hash: &ContentHash) -> bool {
        let mut slots = self.slots.write().await;
        if slots.contains_key(content_hash) {
            return false;
        }
        slots.insert(content_hash.clone(), HandleSlot::Pending);
        true
    }

    pub(crate) async fn attach(&self, handle: &TorrentHandle) -> AttachOutcome {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get_mut(&handle.content_hash) else {
            return AttachOutcome::Untracked;
        };
        match slot {
            HandleSlot::Live(current) if current == handle => AttachOutcome::Unchanged,
            HandleSlot::Live(current) => {
                let previous = std::mem::replace(current, handle.clone());
                AttachOutcome::Replaced(previous)
            }
            HandleSlot::Pending => {
                *slot = HandleSlot::Live(handle.clone());
                AttachOutcome::Attached
            }
        }
    }

    pub(crate) async fn live(&self, content_hash: &ContentHash) -> Option<TorrentHandle> {
        match self.slots.read().await.get(content_hash) {
            Some(HandleSlot::Live(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub(crate) async fn contains(&self, content_hash: &ContentHash) -> bool {
        self.slots.read().await.contains_key(content_hash)
    }

    pub(crate) async fn remove(&self, content_hash: &ContentHash) -> Option<HandleSlot> {
        self.slots.write().await.remove(content_hash)
    }

    /// Drop the slot only while it is still waiting for a handle.
    pub(crate) async fn release_pending(&self, content_hash: &ContentHash) -> bool {
        let mut slots = self.slots.write().await;
        if slots.get(content_hash) == Some(&HandleSlot::Pending) {
            slots.remove(content_hash);
            return true;
        }
        false
    }

    /// Snapshot of every live handle.
    pub(crate) async fn live_handles(&self) -> Vec<TorrentHandle> {
        self.slots
            .read()
            .await
            .values()
            .filter_map(|slot| match slot {
                HandleSlot::Live(handle) => Some(handle.clone()),
                HandleSlot::Pending => None,
            })
            .collect()
    }

    pub(crate) async fn live_count(&self) -> usize {
        self.slots
            .read()
            .await
            .values()
            .filter(|slot| matches!(slot, HandleSlot::Live(_)))
            .count()
    }
}
