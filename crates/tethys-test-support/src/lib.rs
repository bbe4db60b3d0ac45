#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Shared test helpers used across integration suites.
//! Layout: fixtures.rs (hashes, magnets, metadata), transport.rs (scripted
//! transport double), store.rs (store with switchable failures), keepalive.rs
//! (recording sink), wait.rs (polling assertions).

pub mod fixtures;
pub mod keepalive;
pub mod store;
pub mod transport;
pub mod wait;

pub use fixtures::{magnet_uri, memory_store, sample_hash, sample_metadata};
pub use keepalive::RecordingKeepalive;
pub use store::FlakyStore;
pub use transport::{ScriptedTransport, TransportCall};
pub use wait::{wait_for_record, wait_until};
