#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! Engine-agnostic torrent domain model, error taxonomy, and collaborator traits.
//!
//! # Design
//! - Every torrent is identified by its [`model::ContentHash`]; handles into a
//!   running transport are separate, short-lived tokens.
//! - Writers express updates as [`model::TorrentPatch`] values so stores can
//!   merge per field.
//! - Transport and store are reached only through [`service`] traits.

pub mod error;
pub mod model;
pub mod service;

pub use error::{TorrentError, TorrentResult};
pub use model::{
    AddTorrent, ContentHash, EngineState, FilePriority, FilePriorityOverride, FileRecord,
    MetadataFile, PLACEHOLDER_NAME, RemoveTorrent, SourceDescriptor, TorrentHandle,
    TorrentMetadata, TorrentPatch, TorrentRecord, TorrentState, TorrentStats, TransferStats,
    TransportNotification,
};
pub use service::{
    KeepaliveSignal, KeepaliveSink, TorrentInspector, TorrentSnapshot, TorrentStore,
    TorrentWorkflow, TransportEngine,
};
