#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Tethys session engine and application bootstrap.
//!
//! Layout: `session.rs` (control facade, recovery, shutdown), `registry.rs`
//! (live handle ownership), `dispatcher.rs` (notification state machine),
//! `poller.rs` (transfer counter sampling), `lifecycle.rs` (keepalive edges),
//! `bootstrap.rs` (process wiring).
//!
//! # Design
//! - The dispatcher, poller and lifecycle loops never call each other; they
//!   meet only at the store and the handle registry.
//! - All record writes are per-field merges, so event-driven and polled
//!   updates to the same record never clobber each other.

/// Application bootstrap and environment loading.
pub mod bootstrap;
mod dispatcher;
pub mod error;
mod keepalive;
mod lifecycle;
mod poller;
mod registry;
pub mod session;

pub use bootstrap::run_app;
pub use error::{AppError, AppResult};
pub use keepalive::TracingKeepalive;
pub use session::{
    DEFAULT_POLL_INTERVAL, DEFAULT_RETRY_BACKLOG, DEFAULT_RETRY_INTERVAL, SessionDeps,
    SessionEngine, SessionOptions,
};
