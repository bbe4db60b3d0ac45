//! [`TorrentStore`] wrapper with switchable failures.

use std::collections::HashSet;
use std::io;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tethys_runtime::RuntimeStore;
use tethys_torrent_core::{
    ContentHash, FilePriorityOverride, TorrentError, TorrentPatch, TorrentRecord, TorrentResult,
    TorrentSnapshot, TorrentState, TorrentStore,
};
use tokio::sync::watch;

/// Delegates to a [`RuntimeStore`] until an operation is told to fail.
///
/// Operation names match the trait methods (`"get"`, `"update_fields"`, ...).
pub struct FlakyStore {
    inner: RuntimeStore,
    failing: Mutex<HashSet<&'static str>>,
}

impl FlakyStore {
    /// Wrap `inner` with every operation healthy.
    #[must_use]
    pub fn new(inner: RuntimeStore) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make `operation` fail until healed.
    pub fn fail(&self, operation: &'static str) {
        self.failing().insert(operation);
    }

    /// Let `operation` succeed again.
    pub fn heal(&self, operation: &'static str) {
        self.failing().remove(operation);
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &RuntimeStore {
        &self.inner
    }

    fn failing(&self) -> MutexGuard<'_, HashSet<&'static str>> {
        self.failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check(&self, operation: &'static str) -> TorrentResult<()> {
        if self.failing().contains(operation) {
            return Err(TorrentError::store(
                operation,
                io::Error::other("scripted store failure"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TorrentStore for FlakyStore {
    async fn upsert(&self, record: &TorrentRecord) -> TorrentResult<()> {
        self.check("upsert")?;
        self.inner.upsert(record).await
    }

    async fn get(&self, content_hash: &ContentHash) -> TorrentResult<Option<TorrentRecord>> {
        self.check("get")?;
        self.inner.get(content_hash).await
    }

    async fn list_all(&self) -> TorrentResult<Vec<TorrentRecord>> {
        self.check("list_all")?;
        self.inner.list_all().await
    }

    async fn list_where(&self, states: &[TorrentState]) -> TorrentResult<Vec<TorrentRecord>> {
        self.check("list_where")?;
        self.inner.list_where(states).await
    }

    async fn update_fields(
        &self,
        content_hash: &ContentHash,
        patch: &TorrentPatch,
    ) -> TorrentResult<bool> {
        self.check("update_fields")?;
        self.inner.update_fields(content_hash, patch).await
    }

    async fn set_file_priorities(
        &self,
        content_hash: &ContentHash,
        changes: &[FilePriorityOverride],
    ) -> TorrentResult<bool> {
        self.check("set_file_priorities")?;
        self.inner.set_file_priorities(content_hash, changes).await
    }

    async fn delete(&self, content_hash: &ContentHash) -> TorrentResult<bool> {
        self.check("delete")?;
        self.inner.delete(content_hash).await
    }

    async fn count(&self) -> TorrentResult<usize> {
        self.check("count")?;
        self.inner.count().await
    }

    fn subscribe_all(&self) -> watch::Receiver<TorrentSnapshot> {
        self.inner.subscribe_all()
    }
}
