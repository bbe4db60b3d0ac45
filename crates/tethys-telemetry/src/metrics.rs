//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Encapsulates collector registration to keep the public API small.
//! - Exposes the counters and gauges the session loops report into.

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across the session loops.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    notifications_total: IntCounterVec,
    stale_notifications_total: IntCounter,
    store_failures_total: IntCounterVec,
    poll_failures_total: IntCounter,
    recovery_failures_total: IntCounter,
    live_handles: IntGauge,
    active_torrents: IntGauge,
    keepalive_active: IntGauge,
    retry_backlog: IntGauge,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Handles currently registered with the transport.
    pub live_handles: i64,
    /// Persisted records in the active state set.
    pub active_torrents: i64,
    /// Whether the keepalive signal is raised (0 or 1).
    pub keepalive_active: i64,
    /// Notifications waiting for a store retry.
    pub retry_backlog: i64,
    /// Notifications dropped because their record no longer exists.
    pub stale_notifications_total: u64,
    /// Failed status snapshots.
    pub poll_failures_total: u64,
    /// Records that could not be re-admitted at startup.
    pub recovery_failures_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be built or
    /// registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let notifications_total = IntCounterVec::new(
            Opts::new(
                "transport_notifications_total",
                "Transport notifications applied by kind",
            ),
            &["kind"],
        )
        .map_err(collector("transport_notifications_total"))?;
        let stale_notifications_total = counter(
            "stale_notifications_total",
            "Notifications dropped for unknown torrents",
        )?;
        let store_failures_total = IntCounterVec::new(
            Opts::new("store_failures_total", "Durable store failures by component"),
            &["component"],
        )
        .map_err(collector("store_failures_total"))?;
        let poll_failures_total =
            counter("poll_failures_total", "Failed transfer status snapshots")?;
        let recovery_failures_total = counter(
            "recovery_failures_total",
            "Records that failed to re-admit at startup",
        )?;
        let live_handles = gauge("live_handles", "Handles registered with the transport")?;
        let active_torrents = gauge("active_torrents", "Persisted records in an active state")?;
        let keepalive_active = gauge("keepalive_active", "Whether the keepalive is raised")?;
        let retry_backlog = gauge(
            "dispatcher_retry_backlog",
            "Notifications waiting for a store retry",
        )?;

        register(&registry, "transport_notifications_total", &notifications_total)?;
        register(&registry, "stale_notifications_total", &stale_notifications_total)?;
        register(&registry, "store_failures_total", &store_failures_total)?;
        register(&registry, "poll_failures_total", &poll_failures_total)?;
        register(&registry, "recovery_failures_total", &recovery_failures_total)?;
        register(&registry, "live_handles", &live_handles)?;
        register(&registry, "active_torrents", &active_torrents)?;
        register(&registry, "keepalive_active", &keepalive_active)?;
        register(&registry, "dispatcher_retry_backlog", &retry_backlog)?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                notifications_total,
                stale_notifications_total,
                store_failures_total,
                poll_failures_total,
                recovery_failures_total,
                live_handles,
                active_torrents,
                keepalive_active,
                retry_backlog,
            }),
        })
    }

    /// Count an applied transport notification.
    pub fn inc_notification(&self, kind: &str) {
        self.inner
            .notifications_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Count a notification dropped for an unknown torrent.
    pub fn inc_stale_notification(&self) {
        self.inner.stale_notifications_total.inc();
    }

    /// Count a durable store failure in the named component.
    pub fn inc_store_failure(&self, component: &str) {
        self.inner
            .store_failures_total
            .with_label_values(&[component])
            .inc();
    }

    /// Count a failed status snapshot.
    pub fn inc_poll_failure(&self) {
        self.inner.poll_failures_total.inc();
    }

    /// Count a record that failed to recover.
    pub fn inc_recovery_failure(&self) {
        self.inner.recovery_failures_total.inc();
    }

    /// Set the live handle gauge.
    pub fn set_live_handles(&self, count: usize) {
        self.inner.live_handles.set(to_i64(count));
    }

    /// Set the active torrent gauge.
    pub fn set_active_torrents(&self, count: usize) {
        self.inner.active_torrents.set(to_i64(count));
    }

    /// Record whether the keepalive is raised.
    pub fn set_keepalive(&self, active: bool) {
        self.inner.keepalive_active.set(i64::from(active));
    }

    /// Set the dispatcher retry backlog gauge.
    pub fn set_retry_backlog(&self, depth: usize) {
        self.inner.retry_backlog.set(to_i64(depth));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_handles: self.inner.live_handles.get(),
            active_torrents: self.inner.active_torrents.get(),
            keepalive_active: self.inner.keepalive_active.get(),
            retry_backlog: self.inner.retry_backlog.get(),
            stale_notifications_total: self.inner.stale_notifications_total.get(),
            poll_failures_total: self.inner.poll_failures_total.get(),
            recovery_failures_total: self.inner.recovery_failures_total.get(),
        }
    }
}

fn collector(name: &'static str) -> impl FnOnce(prometheus::Error) -> TelemetryError {
    move |source| TelemetryError::MetricsCollector { name, source }
}

fn counter(name: &'static str, help: &str) -> Result<IntCounter> {
    IntCounter::with_opts(Opts::new(name, help)).map_err(collector(name))
}

fn gauge(name: &'static str, help: &str) -> Result<IntGauge> {
    IntGauge::with_opts(Opts::new(name, help)).map_err(collector(name))
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> Result<()>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
