use std::fmt;

use thiserror::Error;

use crate::SignalId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io {0}")]
    Io(#[from] std::io::Error),
    #[error("store {0}")]
    Store(#[from] rusqlite::Error),
    #[error("arrow {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[cfg(feature = "parquet")]
    #[error("parquet {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("config {0}")]
    Config(String),
    #[error("toml {0}")]
    Toml(#[from] toml::de::Error),
    #[error("signal not found {0}")]
    NotFound(SignalId),
    #[error("column not found {0}")]
    ColumnNotFound(String),
    #[error("expected {expected} columns, got {actual}")]
    ColumnCount { expected: usize, actual: usize },
    #[error("row {row} out of bounds for {len} rows")]
    RowOutOfBounds { row: usize, len: usize },
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid time window: {0}")]
    InvalidWindow(String),
    #[error("signal {signal} has {actual} rows, expected {expected} to share a cursor")]
    RowCountMismatch {
        signal: SignalId,
        expected: usize,
        actual: usize,
    },
    #[error("signal {0} is already driven by another replay")]
    AlreadyClaimed(SignalId),
    #[error("signal {0} is not owned by this writer")]
    NotOwned(SignalId),
    #[error("signal {signal} holds {expected} state, got {actual}")]
    ShapeMismatch {
        signal: SignalId,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("replay task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// A single signal's history could not be loaded.
#[derive(Debug, Error)]
#[error("query for {signal} failed: {cause}")]
pub struct QueryError {
    pub signal: SignalId,
    #[source]
    pub cause: Error,
}

impl QueryError {
    pub fn new(signal: SignalId, cause: impl Into<Error>) -> Self {
        QueryError {
            signal,
            cause: cause.into(),
        }
    }
}

/// A replay tick that could not move a row into the state store.
#[derive(Debug, Error)]
pub struct TickError {
    pub signal: SignalId,
    pub cursor: usize,
    #[source]
    pub cause: Error,
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tick for {} at row {} failed: {}",
            self.signal, self.cursor, self.cause
        )
    }
}
