//! Record sources and the lazy iterator contract the pipeline pulls from.
//!
//! A [`Source`] hands out a fresh, single-use [`RecordIterator`] per run. The
//! iterator folds the classic `next()/value()/err()` trio into one call:
//!
//! - `Ok(Some(record))`: a record is available
//! - `Ok(None)`: the source is drained
//! - `Err(e)`: the source failed; no further records will be produced
//!
//! [`TrackedIterator`] wraps any iterator and enforces the state machine
//! `Ready → Active → {Exhausted | Errored} → Closed`, with `close()` reaching
//! the inner iterator at most once.

mod delimited;
mod jsonl;
mod memory;

pub use delimited::CsvSource;
pub use jsonl::JsonLinesSource;
pub use memory::{MemorySource, MockSource};

use crate::config::SourceConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Record, RecordPool};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A lazy, forward-only, single-pass sequence of records.
#[async_trait]
pub trait RecordIterator: Send {
    /// Advance to the next record.
    async fn next(&mut self, cancel: &CancellationToken) -> PipelineResult<Option<Record>>;

    /// Release resources. Must be idempotent.
    async fn close(&mut self) -> PipelineResult<()>;
}

/// Producer of record iterators.
#[async_trait]
pub trait Source: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Open a fresh iterator over the source.
    async fn stream(&self, cancel: &CancellationToken) -> PipelineResult<Box<dyn RecordIterator>>;
}

/// Lifecycle of an iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    Ready,
    Active,
    Exhausted,
    Errored,
    Closed,
}

/// Iterator wrapper that enforces the lifecycle state machine.
pub struct TrackedIterator {
    inner: Box<dyn RecordIterator>,
    state: IteratorState,
}

impl TrackedIterator {
    pub fn new(inner: Box<dyn RecordIterator>) -> Self {
        Self {
            inner,
            state: IteratorState::Ready,
        }
    }

    pub fn state(&self) -> IteratorState {
        self.state
    }
}

#[async_trait]
impl RecordIterator for TrackedIterator {
    async fn next(&mut self, cancel: &CancellationToken) -> PipelineResult<Option<Record>> {
        match self.state {
            IteratorState::Closed => {
                return Err(PipelineError::source_error("iterator is closed"));
            }
            IteratorState::Exhausted | IteratorState::Errored => return Ok(None),
            IteratorState::Ready | IteratorState::Active => {}
        }

        self.state = IteratorState::Active;
        match self.inner.next(cancel).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => {
                self.state = IteratorState::Exhausted;
                Ok(None)
            }
            Err(e) => {
                // Cancellation is not a source failure; the iterator stays usable.
                if !e.is_cancellation() {
                    self.state = IteratorState::Errored;
                }
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> PipelineResult<()> {
        if self.state == IteratorState::Closed {
            return Ok(());
        }
        self.state = IteratorState::Closed;
        self.inner.close().await
    }
}

/// Build a source from configuration. File-backed sources draw their record
/// containers from `pool`.
pub fn from_config(config: &SourceConfig, pool: Arc<RecordPool>) -> Arc<dyn Source> {
    match config {
        SourceConfig::Mock { count } => Arc::new(MockSource::new(*count, pool)),
        SourceConfig::Csv {
            path,
            delimiter,
            infer_types,
        } => Arc::new(
            CsvSource::new(path, pool)
                .with_delimiter(*delimiter)
                .with_type_inference(*infer_types),
        ),
        SourceConfig::JsonLines { path } => Arc::new(JsonLinesSource::new(path, pool)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    /// Iterator that yields `ok` records, then fails.
    struct FailingIterator {
        ok: usize,
        closes: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl RecordIterator for FailingIterator {
        async fn next(&mut self, _cancel: &CancellationToken) -> PipelineResult<Option<Record>> {
            if self.ok == 0 {
                return Err(PipelineError::source_error("connection reset"));
            }
            self.ok -= 1;
            Ok(Some(record_from([("v", json!(self.ok))])))
        }

        async fn close(&mut self) -> PipelineResult<()> {
            self.closes
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_tracked_iterator_exhaustion() {
        let source = MemorySource::new(vec![record_from([("a", json!(1))])]);
        let cancel = CancellationToken::new();
        let mut it = TrackedIterator::new(source.stream(&cancel).await.unwrap());

        assert_eq!(it.state(), IteratorState::Ready);
        assert!(it.next(&cancel).await.unwrap().is_some());
        assert_eq!(it.state(), IteratorState::Active);
        assert!(it.next(&cancel).await.unwrap().is_none());
        assert_eq!(it.state(), IteratorState::Exhausted);
        // Stays exhausted
        assert!(it.next(&cancel).await.unwrap().is_none());

        it.close().await.unwrap();
        assert_eq!(it.state(), IteratorState::Closed);
        assert!(it.next(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_tracked_iterator_error_then_close_once() {
        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut it = TrackedIterator::new(Box::new(FailingIterator {
            ok: 1,
            closes: closes.clone(),
        }));
        let cancel = CancellationToken::new();

        assert!(it.next(&cancel).await.unwrap().is_some());
        let err = it.next(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Source);
        assert_eq!(it.state(), IteratorState::Errored);
        assert!(it.next(&cancel).await.unwrap().is_none());

        it.close().await.unwrap();
        it.close().await.unwrap();
        assert_eq!(closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
