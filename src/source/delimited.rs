//! Delimited-text file source backed by the `csv` crate.
//!
//! Parsing is blocking, so rows are decoded on a `spawn_blocking` producer
//! and handed to the async iterator through a bounded channel. The header
//! row names the fields of every record.

use super::{RecordIterator, Source};
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Record, RecordPool};
use async_trait::async_trait;
use serde_json::{Number, Value};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Rows buffered between the parser thread and the iterator.
const ROW_BUFFER: usize = 256;

/// Source reading one record per row of a delimited file.
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
    delimiter: char,
    infer_types: bool,
    pool: Arc<RecordPool>,
}

impl CsvSource {
    pub fn new(path: impl AsRef<Path>, pool: Arc<RecordPool>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            delimiter: ',',
            infer_types: true,
            pool,
        }
    }

    /// Field separator; must be ASCII.
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// When enabled, numeric and boolean cells become typed values and empty
    /// cells become null. Otherwise every cell is a string.
    pub fn with_type_inference(mut self, infer: bool) -> Self {
        self.infer_types = infer;
        self
    }
}

#[async_trait]
impl Source for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    async fn stream(&self, cancel: &CancellationToken) -> PipelineResult<Box<dyn RecordIterator>> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if !self.delimiter.is_ascii() {
            return Err(PipelineError::InvalidConfig(format!(
                "csv delimiter must be an ASCII character, got {:?}",
                self.delimiter
            )));
        }
        let delimiter = self.delimiter as u8;

        let path = self.path.clone();
        let (reader, headers) = tokio::task::spawn_blocking(move || open_reader(&path, delimiter))
            .await
            .map_err(PipelineError::source_error)??;

        tracing::debug!(
            "Opened {} with {} columns",
            self.path.display(),
            headers.len()
        );

        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        let stop = CancellationToken::new();
        let producer = {
            let stop = stop.clone();
            let pool = self.pool.clone();
            let infer_types = self.infer_types;
            tokio::task::spawn_blocking(move || {
                produce_rows(reader, headers, pool, infer_types, stop, tx)
            })
        };

        Ok(Box::new(CsvIterator {
            rx,
            stop,
            producer: Some(producer),
        }))
    }
}

fn open_reader(path: &Path, delimiter: u8) -> PipelineResult<(csv::Reader<File>, Vec<String>)> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| {
            PipelineError::source_error(format!("failed to open {}: {}", path.display(), e))
        })?;
    let headers = reader
        .headers()
        .map_err(PipelineError::source_error)?
        .iter()
        .map(str::to_string)
        .collect();
    Ok((reader, headers))
}

fn produce_rows(
    mut reader: csv::Reader<File>,
    headers: Vec<String>,
    pool: Arc<RecordPool>,
    infer_types: bool,
    stop: CancellationToken,
    tx: mpsc::Sender<PipelineResult<Record>>,
) {
    for row in reader.records() {
        if stop.is_cancelled() {
            break;
        }
        let item = row.map_err(PipelineError::source_error).map(|row| {
            let mut record = pool.get();
            for (name, cell) in headers.iter().zip(row.iter()) {
                let value = if infer_types {
                    infer_value(cell)
                } else {
                    Value::String(cell.to_string())
                };
                record.insert(name.clone(), value);
            }
            record
        });
        let failed = item.is_err();
        if tx.blocking_send(item).is_err() || failed {
            break;
        }
    }
}

/// Type a raw cell: integer, float, bool, null for empty, else string.
pub(crate) fn infer_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = cell.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match cell {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(cell.to_string()),
    }
}

struct CsvIterator {
    rx: mpsc::Receiver<PipelineResult<Record>>,
    stop: CancellationToken,
    producer: Option<JoinHandle<()>>,
}

#[async_trait]
impl RecordIterator for CsvIterator {
    async fn next(&mut self, cancel: &CancellationToken) -> PipelineResult<Option<Record>> {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            item = self.rx.recv() => item,
        };

        match item {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None => {
                // Channel closed: either the file is drained or the parser died.
                if let Some(producer) = self.producer.take() {
                    producer.await.map_err(PipelineError::source_error)?;
                }
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> PipelineResult<()> {
        self.stop.cancel();
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            producer.await.map_err(PipelineError::source_error)?;
        }
        Ok(())
    }
}
