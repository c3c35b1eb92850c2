use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::{ColumnSet, Error, QueryError, SignalId, query::QueryBatch};

/// Retained query results, one immutable [`ColumnSet`] per signal.
///
/// Chunks are only ever replaced wholesale; readers holding an older
/// `Arc<ColumnSet>` keep seeing the rows they started with.
#[derive(Default)]
pub struct ChunkBuffer {
    chunks: DashMap<SignalId, Arc<ColumnSet>>,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, signal: SignalId, chunk: ColumnSet) {
        debug!(%signal, rows = chunk.row_count(), "storing chunk");
        self.chunks.insert(signal, Arc::new(chunk));
    }

    /// Stores every chunk of `batch` and hands back the failures.
    pub fn populate(&self, batch: QueryBatch) -> Vec<QueryError> {
        let QueryBatch { chunks, errors } = batch;
        for (signal, chunk) in chunks {
            self.insert(signal, chunk);
        }
        errors
    }

    pub fn get(&self, signal: &str) -> Result<Arc<ColumnSet>, Error> {
        self.chunks
            .get(signal)
            .map(|chunk| chunk.value().clone())
            .ok_or_else(|| Error::NotFound(SignalId::from(signal)))
    }

    pub fn row_count(&self, signal: &str) -> Result<usize, Error> {
        self.chunks
            .get(signal)
            .map(|chunk| chunk.row_count())
            .ok_or_else(|| Error::NotFound(SignalId::from(signal)))
    }

    pub fn contains(&self, signal: &str) -> bool {
        self.chunks.contains_key(signal)
    }

    pub fn signals(&self) -> Vec<SignalId> {
        let mut signals: Vec<_> = self.chunks.iter().map(|kv| kv.key().clone()).collect();
        signals.sort();
        signals
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
