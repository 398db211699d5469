//! Records, chunks and the containers that move them through the pipeline.

mod chunk;
mod pool;

pub use chunk::{split_chunk, Chunk, ChunkAssembler, WorkResult, DEFAULT_CHUNK_SIZE};
pub use pool::{RecordPool, RecordPoolStats, DEFAULT_POOL_CAPACITY};

use std::collections::HashMap;

/// One row of data: field name to dynamically typed value.
pub type Record = HashMap<String, serde_json::Value>;

/// Build a record from `(field, value)` pairs.
pub fn record_from<I, K>(fields: I) -> Record
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    fields.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
