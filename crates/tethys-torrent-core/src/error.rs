//! Error types shared by the session engine and its collaborators.

use std::error::Error;
use std::path::PathBuf;

use thiserror::Error;

use crate::model::ContentHash;

/// Primary error type for torrent operations.
#[derive(Debug, Error)]
pub enum TorrentError {
    /// The source descriptor could not be parsed into a content hash.
    #[error("invalid torrent source")]
    InvalidSource {
        /// Source URI as supplied by the caller.
        source_uri: String,
        /// Why the source was rejected.
        reason: &'static str,
    },
    /// The transport engine is not running or has been shut down.
    #[error("transport engine unavailable")]
    TransportUnavailable {
        /// Operation identifier.
        operation: &'static str,
    },
    /// Operation referenced a content hash with no persisted record.
    #[error("torrent not found")]
    NotFound {
        /// Missing content hash.
        content_hash: ContentHash,
    },
    /// Operation is not supported by the underlying engine.
    #[error("torrent operation not supported")]
    Unsupported {
        /// Operation identifier.
        operation: &'static str,
    },
    /// The transport engine reported a failure.
    #[error("transport operation failed")]
    Transport {
        /// Operation identifier.
        operation: &'static str,
        /// Content hash when available.
        content_hash: Option<ContentHash>,
        /// Engine-provided failure description.
        message: String,
    },
    /// The durable store failed to read or write.
    #[error("torrent store operation failed")]
    Store {
        /// Operation identifier.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
    /// Local filesystem work around a torrent payload failed.
    #[error("torrent filesystem operation failed")]
    Filesystem {
        /// Operation identifier.
        operation: &'static str,
        /// Path being touched.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
}

impl TorrentError {
    /// Wrap a store failure with the operation that triggered it.
    pub fn store(operation: &'static str, source: impl Error + Send + Sync + 'static) -> Self {
        Self::Store {
            operation,
            source: Box::new(source),
        }
    }

    /// Build a transport failure without an associated torrent.
    pub fn transport(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            content_hash: None,
            message: message.into(),
        }
    }

    /// Whether the error reports an unknown content hash.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Convenience alias for torrent operation results.
pub type TorrentResult<T> = Result<T, TorrentError>;
