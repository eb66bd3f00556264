//! On-disk progress snapshots and the closed-trade journal.

pub mod journal;
pub mod snapshot;

use std::path::PathBuf;

use thiserror::Error;

pub use journal::{ClosedTradeRecord, InMemoryTradeJournal, JsonlTradeJournal, TradeJournal};
pub use snapshot::{PositionProgress, SnapshotStore};

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Filesystem failure.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
