//! Serialization of record batches with start/chunk/end framing.
//!
//! Streaming output is `start + chunk_0 + (delimiter + chunk_i)* + end`, and
//! must be byte-identical to [`Formatter::format_all`] over the same records.
//! Every formatter here writes fields in sorted key order so output does not
//! depend on map iteration order.

mod delimited;
mod json;
mod yaml;

pub use delimited::CsvFormatter;
pub use json::{JsonArrayFormatter, JsonLinesFormatter};
pub use yaml::YamlFormatter;

use crate::config::FormatConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::record::Record;
use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Three-phase serializer.
///
/// A formatter may keep per-run state (for example whether a CSV header has
/// been written); `format_start` resets it. A single formatter instance must
/// not be shared by concurrently running pipelines.
pub trait Formatter: Send + Sync {
    fn name(&self) -> &str;

    /// Opening framing, written once before any chunk.
    fn format_start(&self) -> PipelineResult<Bytes>;

    /// Serialize one non-empty chunk.
    fn format_chunk(&self, records: &[Record]) -> PipelineResult<Bytes>;

    /// Closing framing, written once after the last chunk.
    fn format_end(&self) -> PipelineResult<Bytes>;

    /// Separator written between consecutive chunks.
    fn delimiter(&self) -> &[u8] {
        b""
    }

    /// Single-shot serialization of a whole record set.
    fn format_all(&self, records: &[Record]) -> PipelineResult<Bytes> {
        let mut out = BytesMut::new();
        out.extend_from_slice(&self.format_start()?);
        if !records.is_empty() {
            out.extend_from_slice(&self.format_chunk(records)?);
        }
        out.extend_from_slice(&self.format_end()?);
        Ok(out.freeze())
    }
}

/// Sorted view of a record for deterministic serialization.
pub(crate) fn sorted(record: &Record) -> BTreeMap<&str, &Value> {
    record.iter().map(|(k, v)| (k.as_str(), v)).collect()
}

pub(crate) fn json_error(e: serde_json::Error) -> PipelineError {
    PipelineError::format(e)
}

pub fn from_config(config: &FormatConfig) -> Arc<dyn Formatter> {
    match config {
        FormatConfig::Json => Arc::new(JsonArrayFormatter::new()),
        FormatConfig::JsonLines => Arc::new(JsonLinesFormatter::new()),
        FormatConfig::Csv { columns, delimiter } => {
            let formatter = match columns {
                Some(columns) => CsvFormatter::with_columns(columns.clone()),
                None => CsvFormatter::new(),
            };
            Arc::new(formatter.with_delimiter(*delimiter))
        }
        FormatConfig::Yaml => Arc::new(YamlFormatter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    /// Stream `records` through `formatter` in chunks of `chunk_size`,
    /// framing exactly as the pipeline does.
    fn stream_in_chunks(
        formatter: &dyn Formatter,
        records: &[Record],
        chunk_size: usize,
    ) -> Vec<u8> {
        let mut out = formatter.format_start().unwrap().to_vec();
        for (i, chunk) in records.chunks(chunk_size).enumerate() {
            if i > 0 {
                out.extend_from_slice(formatter.delimiter());
            }
            out.extend_from_slice(&formatter.format_chunk(chunk).unwrap());
        }
        out.extend_from_slice(&formatter.format_end().unwrap());
        out
    }

    fn sample(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                record_from([
                    ("id", json!(i)),
                    ("name", json!(format!("row \"{}\", ok", i))),
                    ("amount", json!(i as f64 * 1.5)),
                    ("flag", json!(i % 2 == 0)),
                ])
            })
            .collect()
    }

    #[test]
    fn test_streaming_matches_single_shot_for_all_formatters() {
        let formatters: Vec<Arc<dyn Formatter>> = vec![
            Arc::new(JsonArrayFormatter::new()),
            Arc::new(JsonLinesFormatter::new()),
            Arc::new(CsvFormatter::new()),
            Arc::new(CsvFormatter::with_columns(vec!["name".into(), "id".into()])),
            Arc::new(YamlFormatter::new()),
        ];

        for formatter in &formatters {
            for n in [0, 1, 7, 25] {
                let records = sample(n);
                let expected = formatter.format_all(&records).unwrap();
                for chunk_size in [1, 3, 10, 100] {
                    let streamed = stream_in_chunks(formatter.as_ref(), &records, chunk_size);
                    assert_eq!(
                        streamed,
                        expected.to_vec(),
                        "{} with {} records in chunks of {}",
                        formatter.name(),
                        n,
                        chunk_size
                    );
                }
            }
        }
    }

    #[test]
    fn test_sorted_view() {
        let record = record_from([("b", json!(1)), ("a", json!(2))]);
        let keys: Vec<&str> = sorted(&record).into_keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }
}
