//! YAML formatter: the whole run is one block sequence of mappings.

use super::{sorted, Formatter};
use crate::error::{PipelineError, PipelineResult};
use crate::record::Record;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};

/// Block-sequence items serialize independently, so concatenating chunk
/// output yields the same document as serializing every record at once.
/// An empty run is written as the flow sequence `[]`.
#[derive(Debug, Default)]
pub struct YamlFormatter {
    wrote_records: AtomicBool,
}

impl YamlFormatter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Formatter for YamlFormatter {
    fn name(&self) -> &str {
        "yaml"
    }

    fn format_start(&self) -> PipelineResult<Bytes> {
        self.wrote_records.store(false, Ordering::Relaxed);
        Ok(Bytes::new())
    }

    fn format_chunk(&self, records: &[Record]) -> PipelineResult<Bytes> {
        if records.is_empty() {
            return Ok(Bytes::new());
        }
        let items: Vec<_> = records.iter().map(sorted).collect();
        let text = serde_yaml::to_string(&items).map_err(PipelineError::format)?;
        self.wrote_records.store(true, Ordering::Relaxed);
        Ok(Bytes::from(text))
    }

    fn format_end(&self) -> PipelineResult<Bytes> {
        if self.wrote_records.load(Ordering::Relaxed) {
            Ok(Bytes::new())
        } else {
            Ok(Bytes::from_static(b"[]\n"))
        }
    }
}
