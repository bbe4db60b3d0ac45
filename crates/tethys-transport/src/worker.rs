#![allow(clippy::redundant_pub_crate)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tethys_torrent_core::{TorrentError, TorrentHandle, TransportNotification};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::command::EngineCommand;
use crate::session::TransportSession;

pub(crate) const ALERT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) fn spawn(
    mut commands: mpsc::Receiver<EngineCommand>,
    notifications: mpsc::Sender<TransportNotification>,
    session: Box<dyn TransportSession>,
    running: Arc<AtomicBool>,
    alert_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut worker = Worker {
            session,
            notifications,
        };
        let mut poll = tokio::time::interval(alert_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(EngineCommand::Shutdown { respond_to }) => {
                            worker.stop().await;
                            let _ = respond_to.send(());
                            break;
                        }
                        Some(command) => worker.handle(command).await,
                        None => {
                            worker.stop().await;
                            break;
                        }
                    }
                }
                _ = poll.tick() => {
                    if let Err(err) = worker.flush_session_events().await {
                        warn!(error = %err, "transport alert polling failed");
                    }
                }
            }
        }
        running.store(false, Ordering::SeqCst);
        info!("transport session worker stopped");
    })
}

struct Worker {
    session: Box<dyn TransportSession>,
    notifications: mpsc::Sender<TransportNotification>,
}

impl Worker {
    async fn handle(&mut self, command: EngineCommand) {
        let target = command.handle().cloned();
        let result = match command {
            EngineCommand::Add(request) => self.handle_add(*request).await,
            EngineCommand::Pause { handle } => self.session.pause(&handle).await,
            EngineCommand::Resume { handle } => self.session.resume(&handle).await,
            EngineCommand::Remove { handle, options } => {
                self.session.remove(&handle, options).await
            }
            EngineCommand::SetFilePriority {
                handle,
                index,
                priority,
            } => self.session.set_file_priority(&handle, index, priority).await,
            EngineCommand::QueryStatus { handle, respond_to } => {
                let status = self.session.status(&handle).await.map_err(|err| {
                    TorrentError::Transport {
                        operation: "poll_status",
                        content_hash: Some(handle.content_hash.clone()),
                        message: err.to_string(),
                    }
                });
                let _ = respond_to.send(status);
                return;
            }
            EngineCommand::Shutdown { .. } => return,
        };

        if let Err(err) = result {
            warn!(error = %err, "transport command handling failed");
            if let Some(handle) = target {
                self.report_failure(handle, err.to_string()).await;
            }
        }

        if let Err(err) = self.flush_session_events().await {
            warn!(error = %err, "transport alert polling failed");
        }
    }

    async fn handle_add(&mut self, request: tethys_torrent_core::AddTorrent) -> Result<()> {
        let content_hash = request.content_hash.clone();
        match self.session.add_torrent(&request).await {
            Ok(handle) => {
                debug!(
                    content_hash = %content_hash,
                    session_id = %handle.session_id,
                    "torrent admitted to transport session"
                );
                Ok(())
            }
            Err(err) => {
                self.report_failure(TorrentHandle::unassigned(content_hash), err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    async fn report_failure(&mut self, handle: TorrentHandle, message: String) {
        self.forward(TransportNotification::TorrentError { handle, message })
            .await;
    }

    async fn flush_session_events(&mut self) -> Result<()> {
        let events = self.session.poll_events().await?;
        for event in events {
            self.forward(event).await;
        }
        Ok(())
    }

    async fn forward(&mut self, notification: TransportNotification) {
        if self.notifications.send(notification).await.is_err() {
            debug!("notification consumer dropped; discarding transport notification");
        }
    }

    async fn stop(&mut self) {
        if let Err(err) = self.flush_session_events().await {
            warn!(error = %err, "transport alert polling failed during shutdown");
        }
        if let Err(err) = self.session.shutdown().await {
            warn!(error = %err, "transport session shutdown failed");
        }
    }
}
