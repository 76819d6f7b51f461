use std::path::PathBuf;

use thiserror::Error;

use crate::circuit::Category;

/// Console log file failures. Never fatal to ingest: the in-memory ring is
/// authoritative and the file is best-effort.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encode log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a single ingested entry (or a whole batch) was not stored.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid {category} entry: {reason}")]
    Shape { category: Category, reason: String },
    #[error("entry is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("circuit open for {category}: {reason}")]
    CircuitOpen { category: Category, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("pending query queue is full ({cap} active)")]
    Full { cap: usize },
}
