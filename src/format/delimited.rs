//! CSV formatter.
//!
//! Columns are either configured up front or inferred from the sorted keys
//! of the first record formatted in a run. The header row goes out with the
//! start framing when columns are known, otherwise with the first chunk.

use super::Formatter;
use crate::error::{PipelineError, PipelineResult};
use crate::record::Record;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Mutex;

#[derive(Debug)]
pub struct CsvFormatter {
    configured: Option<Vec<String>>,
    delimiter: u8,
    /// Columns in effect for the current run
    active: Mutex<Option<Vec<String>>>,
}

impl Default for CsvFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvFormatter {
    /// Formatter inferring its columns from the first record.
    pub fn new() -> Self {
        Self {
            configured: None,
            delimiter: b',',
            active: Mutex::new(None),
        }
    }

    /// Formatter with a fixed column order. Missing fields become empty cells.
    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            configured: Some(columns),
            ..Self::new()
        }
    }

    /// Non-ASCII delimiters fall back to `,`.
    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = if delimiter.is_ascii() {
            delimiter as u8
        } else {
            b','
        };
        self
    }

    fn write_rows<'a>(&self, rows: impl IntoIterator<Item = Vec<&'a str>>) -> PipelineResult<Bytes> {
        let mut buf = Vec::new();
        {
            let mut writer = csv::WriterBuilder::new()
                .delimiter(self.delimiter)
                .has_headers(false)
                .from_writer(&mut buf);
            for row in rows {
                writer.write_record(row).map_err(PipelineError::format)?;
            }
            writer.flush().map_err(PipelineError::format)?;
        }
        Ok(Bytes::from(buf))
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Vec<String>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

impl Formatter for CsvFormatter {
    fn name(&self) -> &str {
        "csv"
    }

    fn format_start(&self) -> PipelineResult<Bytes> {
        *self.lock_active() = self.configured.clone();
        match &self.configured {
            Some(columns) => {
                self.write_rows([columns.iter().map(String::as_str).collect::<Vec<_>>()])
            }
            None => Ok(Bytes::new()),
        }
    }

    fn format_chunk(&self, records: &[Record]) -> PipelineResult<Bytes> {
        let mut active = self.lock_active();
        let mut header = None;
        if active.is_none() {
            let Some(first) = records.first() else {
                return Ok(Bytes::new());
            };
            let mut columns: Vec<String> = first.keys().cloned().collect();
            columns.sort();
            header = Some(columns.clone());
            *active = Some(columns);
        }
        let columns = active.as_deref().unwrap_or_default();

        let cells: Vec<Vec<String>> = records
            .iter()
            .map(|r| columns.iter().map(|c| cell(r.get(c))).collect())
            .collect();

        let rows = header
            .iter()
            .map(|h| h.iter().map(String::as_str).collect::<Vec<_>>())
            .chain(
                cells
                    .iter()
                    .map(|row| row.iter().map(String::as_str).collect::<Vec<_>>()),
            );
        self.write_rows(rows)
    }

    fn format_end(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    #[test]
    fn test_inferred_header_with_first_chunk() {
        let f = CsvFormatter::new();
        assert!(f.format_start().unwrap().is_empty());

        let first = f
            .format_chunk(&[record_from([("name", json!("a, b")), ("id", json!(1))])])
            .unwrap();
        assert_eq!(&first[..], b"id,name\n1,\"a, b\"\n");

        let second = f
            .format_chunk(&[record_from([("name", json!("c")), ("id", json!(2))])])
            .unwrap();
        assert_eq!(&second[..], b"2,c\n");
    }

    #[test]
    fn test_configured_columns_and_missing_fields() {
        let f = CsvFormatter::with_columns(vec!["id".into(), "note".into()]).with_delimiter(';');
        let out = f
            .format_all(&[record_from([("id", json!(7)), ("extra", json!(true))])])
            .unwrap();
        assert_eq!(&out[..], b"id;note\n7;\n");
    }

    #[test]
    fn test_start_resets_inferred_columns() {
        let f = CsvFormatter::new();
        let a = f.format_all(&[record_from([("x", json!(1))])]).unwrap();
        let b = f.format_all(&[record_from([("y", json!(2))])]).unwrap();
        assert_eq!(&a[..], b"x\n1\n");
        assert_eq!(&b[..], b"y\n2\n");
    }
}
