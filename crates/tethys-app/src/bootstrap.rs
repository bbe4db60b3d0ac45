//! Process bootstrap: configuration, logging, metrics, store, transport and
//! the session engine, torn down again on Ctrl-C.

use std::sync::Arc;

use tethys_config::SessionConfig;
use tethys_events::EventBus;
use tethys_runtime::RuntimeStore;
use tethys_telemetry::{GlobalContextGuard, LogFormat, LoggingConfig, Metrics, build_sha};
use tethys_transport::session::LoopbackSession;
use tethys_transport::{SessionTransport, TransportOptions};
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::keepalive::TracingKeepalive;
use crate::session::{SessionDeps, SessionEngine, SessionOptions};

/// Entry point for the Tethys boot sequence.
///
/// # Errors
///
/// Returns an error if configuration, logging, the store or the session
/// engine cannot be brought up.
pub async fn run_app() -> AppResult<()> {
    let config =
        SessionConfig::from_env().map_err(|err| AppError::config("config.from_env", err))?;
    run_app_with(config).await
}

/// Boot sequence that relies entirely on the supplied configuration.
pub(crate) async fn run_app_with(config: SessionConfig) -> AppResult<()> {
    let logging = LoggingConfig {
        level: &config.log_level,
        format: config
            .log_format
            .as_deref()
            .map_or_else(LogFormat::infer, LogFormat::from_label),
        build_sha: build_sha(),
    };
    tethys_telemetry::init_logging(&logging)
        .map_err(|err| AppError::telemetry("telemetry.init", err))?;
    let _context = GlobalContextGuard::new("session");

    info!(
        database_url = %config.database_url,
        download_root = %config.download_root.display(),
        "tethys bootstrap starting"
    );

    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    let store = RuntimeStore::connect(&config.database_url)
        .await
        .map_err(|err| AppError::store("runtime_store.connect", err))?;
    let transport = SessionTransport::with_options(
        Box::new(LoopbackSession::default()),
        TransportOptions {
            notification_buffer: config.notification_buffer,
            ..TransportOptions::default()
        },
    );

    let engine = SessionEngine::init(SessionDeps {
        transport: Arc::new(transport),
        store: Arc::new(store.clone()),
        keepalive: Arc::new(TracingKeepalive),
        events: EventBus::new(),
        metrics: metrics.clone(),
        options: SessionOptions {
            poll_interval: config.poll_interval,
            download_root: config.download_root.clone(),
            ..SessionOptions::default()
        },
    })
    .await
    .map_err(|err| AppError::session("session.init", err))?;

    let torrents = engine
        .count()
        .await
        .map_err(|err| AppError::session("session.count", err))?;
    info!(torrents, "session engine running; press Ctrl-C to stop");

    let signal = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
    let stopped = engine.shutdown().await;
    match metrics.render() {
        Ok(rendered) => tracing::debug!(metrics = %rendered, "final metrics"),
        Err(err) => error!(error = %err, "failed to render final metrics"),
    }
    store.close().await;

    signal.map_err(|source| AppError::Io {
        operation: "signal.ctrl_c",
        source,
    })?;
    stopped.map_err(|err| AppError::session("session.shutdown", err))
}
