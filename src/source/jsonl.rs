//! JSON-lines file source: one JSON object per line.

use super::{RecordIterator, Source};
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Record, RecordPool};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
    pool: Arc<RecordPool>,
}

impl JsonLinesSource {
    pub fn new(path: impl AsRef<Path>, pool: Arc<RecordPool>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool,
        }
    }
}

#[async_trait]
impl Source for JsonLinesSource {
    fn name(&self) -> &str {
        "json_lines"
    }

    async fn stream(&self, cancel: &CancellationToken) -> PipelineResult<Box<dyn RecordIterator>> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let file = File::open(&self.path).await.map_err(|e| {
            PipelineError::source_error(format!("failed to open {}: {}", self.path.display(), e))
        })?;
        tracing::debug!("Opened {}", self.path.display());

        Ok(Box::new(JsonLinesIterator {
            lines: Some(BufReader::new(file).lines()),
            line_number: 0,
            pool: self.pool.clone(),
        }))
    }
}

struct JsonLinesIterator {
    lines: Option<Lines<BufReader<File>>>,
    line_number: usize,
    pool: Arc<RecordPool>,
}

impl JsonLinesIterator {
    fn parse(&self, line: &str) -> PipelineResult<Record> {
        let value: Value = serde_json::from_str(line).map_err(|e| {
            PipelineError::source_error(format!("line {}: {}", self.line_number, e))
        })?;
        let Value::Object(fields) = value else {
            return Err(PipelineError::source_error(format!(
                "line {}: expected a JSON object",
                self.line_number
            )));
        };

        let mut record = self.pool.get();
        record.extend(fields);
        Ok(record)
    }
}

#[async_trait]
impl RecordIterator for JsonLinesIterator {
    async fn next(&mut self, cancel: &CancellationToken) -> PipelineResult<Option<Record>> {
        loop {
            let Some(lines) = self.lines.as_mut() else {
                return Ok(None);
            };
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                line = lines.next_line() => line.map_err(PipelineError::source_error)?,
            };
            let Some(line) = line else {
                return Ok(None);
            };
            self.line_number += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return self.parse(trimmed).map(Some);
        }
    }

    async fn close(&mut self) -> PipelineResult<()> {
        self.lines = None;
        Ok(())
    }
}
