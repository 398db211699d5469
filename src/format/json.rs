//! JSON array and JSON-lines formatters.

use super::{json_error, sorted, Formatter};
use crate::error::PipelineResult;
use crate::record::Record;
use bytes::{BufMut, Bytes, BytesMut};

/// A single JSON array: `[` + records separated by `,` + `]\n`.
#[derive(Debug, Clone, Default)]
pub struct JsonArrayFormatter;

impl JsonArrayFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Formatter for JsonArrayFormatter {
    fn name(&self) -> &str {
        "json"
    }

    fn format_start(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::from_static(b"["))
    }

    fn format_chunk(&self, records: &[Record]) -> PipelineResult<Bytes> {
        let mut out = BytesMut::new().writer();
        for (i, record) in records.iter().enumerate() {
            if i > 0 {
                out.get_mut().put_u8(b',');
            }
            serde_json::to_writer(&mut out, &sorted(record)).map_err(json_error)?;
        }
        Ok(out.into_inner().freeze())
    }

    fn format_end(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::from_static(b"]\n"))
    }

    fn delimiter(&self) -> &[u8] {
        b","
    }
}

/// One compact JSON object per line, no framing.
#[derive(Debug, Clone, Default)]
pub struct JsonLinesFormatter;

impl JsonLinesFormatter {
    pub fn new() -> Self {
        Self
    }
}

impl Formatter for JsonLinesFormatter {
    fn name(&self) -> &str {
        "json_lines"
    }

    fn format_start(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::new())
    }

    fn format_chunk(&self, records: &[Record]) -> PipelineResult<Bytes> {
        let mut out = BytesMut::new().writer();
        for record in records {
            serde_json::to_writer(&mut out, &sorted(record)).map_err(json_error)?;
            out.get_mut().put_u8(b'\n');
        }
        Ok(out.into_inner().freeze())
    }

    fn format_end(&self) -> PipelineResult<Bytes> {
        Ok(Bytes::new())
    }
}
