#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]

//! Transport engine adapter driving a BitTorrent session on a background worker.
//!
//! # Design
//! - Callers enqueue commands on a bounded channel; a single worker task owns
//!   the [`session::TransportSession`] and applies them in order.
//! - The worker drains session alerts on a fixed interval and forwards them as
//!   [`TransportNotification`]s. Handles are only ever learned from those
//!   notifications.
//! - Command failures against a known handle become `TorrentError`
//!   notifications instead of caller-visible errors.

mod command;
/// Session abstraction and the in-memory loopback implementation.
pub mod session;
/// Magnet URI parsing.
pub mod source;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use command::EngineCommand;
use session::{LoopbackSession, TransportSession};
use tethys_torrent_core::{
    AddTorrent, FilePriority, RemoveTorrent, SourceDescriptor, TorrentError, TorrentHandle,
    TorrentResult, TransferStats, TransportEngine, TransportNotification,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const COMMAND_BUFFER: usize = 128;
/// Default capacity of the notification channel.
pub const DEFAULT_NOTIFICATION_BUFFER: usize = 256;

/// Tunables for the session worker.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Capacity of the notification channel handed to the consumer.
    pub notification_buffer: usize,
    /// How often session alerts are drained.
    pub alert_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            notification_buffer: DEFAULT_NOTIFICATION_BUFFER,
            alert_interval: worker::ALERT_POLL_INTERVAL,
        }
    }
}

/// [`TransportEngine`] backed by a [`TransportSession`] on a worker task.
pub struct SessionTransport {
    commands: mpsc::Sender<EngineCommand>,
    notifications: Mutex<Option<mpsc::Receiver<TransportNotification>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTransport {
    /// Start a worker for `session` with default options.
    #[must_use]
    pub fn new(session: Box<dyn TransportSession>) -> Self {
        Self::with_options(session, TransportOptions::default())
    }

    /// Start a worker for `session`.
    #[must_use]
    pub fn with_options(session: Box<dyn TransportSession>, options: TransportOptions) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (notify_tx, notify_rx) = mpsc::channel(options.notification_buffer.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let worker = worker::spawn(
            rx,
            notify_tx,
            session,
            running.clone(),
            options.alert_interval,
        );
        Self {
            commands,
            notifications: Mutex::new(Some(notify_rx)),
            running,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Start a worker around an empty [`LoopbackSession`].
    #[must_use]
    pub fn loopback() -> Self {
        Self::new(Box::new(LoopbackSession::default()))
    }

    async fn send_command(&self, operation: &'static str, command: EngineCommand) -> TorrentResult<()> {
        if !self.is_running() {
            return Err(TorrentError::TransportUnavailable { operation });
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| TorrentError::TransportUnavailable { operation })
    }
}

#[async_trait]
impl TransportEngine for SessionTransport {
    fn parse_source(&self, source_uri: &str) -> TorrentResult<SourceDescriptor> {
        source::parse_magnet(source_uri)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn add(&self, request: AddTorrent) -> TorrentResult<()> {
        self.send_command("add", EngineCommand::Add(Box::new(request)))
            .await
    }

    async fn pause(&self, handle: &TorrentHandle) -> TorrentResult<()> {
        self.send_command(
            "pause",
            EngineCommand::Pause {
                handle: handle.clone(),
            },
        )
        .await
    }

    async fn resume(&self, handle: &TorrentHandle) -> TorrentResult<()> {
        self.send_command(
            "resume",
            EngineCommand::Resume {
                handle: handle.clone(),
            },
        )
        .await
    }

    async fn remove(&self, handle: &TorrentHandle, options: RemoveTorrent) -> TorrentResult<()> {
        self.send_command(
            "remove",
            EngineCommand::Remove {
                handle: handle.clone(),
                options,
            },
        )
        .await
    }

    async fn set_file_priority(
        &self,
        handle: &TorrentHandle,
        index: u32,
        priority: FilePriority,
    ) -> TorrentResult<()> {
        self.send_command(
            "set_file_priority",
            EngineCommand::SetFilePriority {
                handle: handle.clone(),
                index,
                priority,
            },
        )
        .await
    }

    async fn poll_status(&self, handle: &TorrentHandle) -> TorrentResult<TransferStats> {
        let (respond_to, response) = oneshot::channel();
        self.send_command(
            "poll_status",
            EngineCommand::QueryStatus {
                handle: handle.clone(),
                respond_to,
            },
        )
        .await?;
        response
            .await
            .map_err(|_| TorrentError::TransportUnavailable {
                operation: "poll_status",
            })?
    }

    fn take_notifications(&self) -> Option<mpsc::Receiver<TransportNotification>> {
        self.notifications.lock().ok().and_then(|mut slot| slot.take())
    }

    async fn shutdown(&self) -> TorrentResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let (respond_to, stopped) = oneshot::channel();
        if self
            .commands
            .send(EngineCommand::Shutdown { respond_to })
            .await
            .is_ok()
        {
            let _ = stopped.await;
        }

        let worker = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(worker) = worker
            && let Err(err) = worker.await
        {
            warn!(error = %err, "transport worker terminated abnormally");
        }
        info!("transport session shut down");
        Ok(())
    }
}
