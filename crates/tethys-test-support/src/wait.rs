//! Polling assertions for eventually-consistent state.

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use tethys_torrent_core::{ContentHash, TorrentRecord, TorrentStore};

const POLL_STEP: Duration = Duration::from_millis(10);

/// Poll `check` until it returns `Some` or `timeout` elapses.
///
/// # Errors
///
/// Returns an error naming `what` when the deadline passes.
pub async fn wait_until<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Ok(value);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out after {timeout:?} waiting for {what}");
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

/// Wait until the stored record for `content_hash` satisfies `predicate`.
///
/// # Errors
///
/// Returns an error when the deadline passes or the store fails.
pub async fn wait_for_record<S, P>(
    store: &S,
    content_hash: &ContentHash,
    timeout: Duration,
    predicate: P,
) -> Result<TorrentRecord>
where
    S: TorrentStore + ?Sized,
    P: Fn(&TorrentRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last_seen = None;
    loop {
        let current = store.get(content_hash).await?;
        if let Some(record) = current.as_ref() {
            if predicate(record) {
                return Ok(record.clone());
            }
        }
        last_seen = current.or(last_seen);
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for record {content_hash}; last seen: {last_seen:?}");
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}
