//! Built-in field-level stages.

use super::Transform;
use crate::error::{PipelineError, PipelineResult};
use crate::record::{Record, RecordPool};
use async_trait::async_trait;
use rayon::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Batches at least this large are uppercased on the rayon pool.
const PARALLEL_THRESHOLD: usize = 256;

/// Keep records whose `field` equals `equals`, or, with no value given,
/// records where `field` is present and not null.
#[derive(Debug, Clone)]
pub struct Filter {
    field: String,
    equals: Option<Value>,
    recycle: Option<Arc<RecordPool>>,
}

impl Filter {
    pub fn new(field: impl Into<String>, equals: Option<Value>) -> Self {
        Self {
            field: field.into(),
            equals,
            recycle: None,
        }
    }

    /// Return rejected records to `pool` instead of dropping them.
    pub fn with_pool(mut self, pool: Arc<RecordPool>) -> Self {
        self.recycle = Some(pool);
        self
    }

    fn keep(&self, record: &Record) -> bool {
        match (record.get(&self.field), &self.equals) {
            (Some(value), Some(expected)) => value == expected,
            (Some(value), None) => !value.is_null(),
            (None, _) => false,
        }
    }
}

#[async_trait]
impl Transform for Filter {
    fn name(&self) -> &str {
        "filter"
    }

    async fn process(
        &self,
        _cancel: &CancellationToken,
        mut records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        let Some(pool) = &self.recycle else {
            records.retain(|r| self.keep(r));
            return Ok(records);
        };
        let (kept, rejected): (Vec<Record>, Vec<Record>) =
            records.into_iter().partition(|r| self.keep(r));
        pool.put_all(rejected);
        Ok(kept)
    }
}

/// Move the value of `from` to `to`. Records without `from` pass unchanged.
#[derive(Debug, Clone)]
pub struct Rename {
    from: String,
    to: String,
}

impl Rename {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[async_trait]
impl Transform for Rename {
    fn name(&self) -> &str {
        "rename"
    }

    async fn process(
        &self,
        _cancel: &CancellationToken,
        mut records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        for record in &mut records {
            if let Some(value) = record.remove(&self.from) {
                record.insert(self.to.clone(), value);
            }
        }
        Ok(records)
    }
}

#[derive(Debug, Clone)]
pub struct DropFields {
    fields: Vec<String>,
}

impl DropFields {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl Transform for DropFields {
    fn name(&self) -> &str {
        "drop"
    }

    async fn process(
        &self,
        _cancel: &CancellationToken,
        mut records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        for record in &mut records {
            for field in &self.fields {
                record.remove(field);
            }
        }
        Ok(records)
    }
}

/// Set `field` to a constant on every record, overwriting any existing value.
#[derive(Debug, Clone)]
pub struct SetField {
    field: String,
    value: Value,
}

impl SetField {
    pub fn new(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

#[async_trait]
impl Transform for SetField {
    fn name(&self) -> &str {
        "set"
    }

    async fn process(
        &self,
        _cancel: &CancellationToken,
        mut records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        for record in &mut records {
            record.insert(self.field.clone(), self.value.clone());
        }
        Ok(records)
    }
}

/// Uppercase string fields. Missing and null fields are left alone; any
/// other type fails the batch.
#[derive(Debug, Clone)]
pub struct Uppercase {
    fields: Vec<String>,
}

impl Uppercase {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }
}

fn uppercase_record(record: &mut Record, fields: &[String]) -> PipelineResult<()> {
    for field in fields {
        match record.get_mut(field) {
            Some(Value::String(s)) => *s = s.to_uppercase(),
            Some(Value::Null) | None => {}
            Some(other) => {
                return Err(PipelineError::processing(
                    "uppercase",
                    format!("field '{}' is not a string: {}", field, other),
                ));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Transform for Uppercase {
    fn name(&self) -> &str {
        "uppercase"
    }

    async fn process(
        &self,
        _cancel: &CancellationToken,
        mut records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        if records.len() < PARALLEL_THRESHOLD {
            for record in &mut records {
                uppercase_record(record, &self.fields)?;
            }
            return Ok(records);
        }

        // CPU-bound: keep it off the async workers.
        let fields = self.fields.clone();
        tokio::task::spawn_blocking(move || -> PipelineResult<Vec<Record>> {
            records
                .par_iter_mut()
                .try_for_each(|record| uppercase_record(record, &fields))?;
            Ok(records)
        })
        .await
        .map_err(|e| PipelineError::processing("uppercase", e))?
    }
}
