//! In-process sources: a fixed record list and a synthetic data generator.

use super::{RecordIterator, Source};
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Record, RecordPool};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Source over a record list held in memory. Each stream yields a copy.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Arc<Vec<Record>>,
}

impl MemorySource {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn stream(&self, cancel: &CancellationToken) -> PipelineResult<Box<dyn RecordIterator>> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(Box::new(MemoryIterator {
            records: Some(self.records.clone()),
            position: 0,
        }))
    }
}

struct MemoryIterator {
    records: Option<Arc<Vec<Record>>>,
    position: usize,
}

#[async_trait]
impl RecordIterator for MemoryIterator {
    async fn next(&mut self, _cancel: &CancellationToken) -> PipelineResult<Option<Record>> {
        let Some(records) = &self.records else {
            return Ok(None);
        };
        let record = records.get(self.position).cloned();
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }

    async fn close(&mut self) -> PipelineResult<()> {
        self.records = None;
        Ok(())
    }
}

/// Synthetic source producing `count` deterministic user records.
///
/// Fields: `id` (integer), `name` (string), `email` (string),
/// `score` (integer 0-99), `active` (bool).
#[derive(Debug, Clone)]
pub struct MockSource {
    count: usize,
    pool: Arc<RecordPool>,
}

impl MockSource {
    pub fn new(count: usize, pool: Arc<RecordPool>) -> Self {
        Self { count, pool }
    }
}

#[async_trait]
impl Source for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, cancel: &CancellationToken) -> PipelineResult<Box<dyn RecordIterator>> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        tracing::debug!("Generating {} mock records", self.count);
        Ok(Box::new(MockIterator {
            next_id: 0,
            count: self.count,
            pool: self.pool.clone(),
        }))
    }
}

struct MockIterator {
    next_id: usize,
    count: usize,
    pool: Arc<RecordPool>,
}

#[async_trait]
impl RecordIterator for MockIterator {
    async fn next(&mut self, _cancel: &CancellationToken) -> PipelineResult<Option<Record>> {
        if self.next_id >= self.count {
            return Ok(None);
        }
        let id = self.next_id;
        self.next_id += 1;

        let mut record = self.pool.get();
        record.insert("id".to_string(), json!(id));
        record.insert("name".to_string(), json!(format!("user-{:05}", id)));
        record.insert("email".to_string(), json!(format!("user{}@example.com", id)));
        record.insert("score".to_string(), json!((id * 37) % 100));
        record.insert("active".to_string(), json!(id % 3 != 0));
        Ok(Some(record))
    }

    async fn close(&mut self) -> PipelineResult<()> {
        self.next_id = self.count;
        Ok(())
    }
}
