//! Chunk assembly: turning a one-record-at-a-time stream into indexed batches.

use super::Record;
use crate::error::{PipelineError, PipelineResult};

/// Default number of records per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// An ordered batch of records tagged with its position in the stream.
///
/// `index` is assigned at creation in strictly increasing order; `start..end`
/// is the half-open range of stream offsets the chunk covers.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    data: Vec<Record>,
    index: usize,
    start: usize,
    end: usize,
}

impl Chunk {
    /// Create a chunk covering `start..start + data.len()`.
    pub fn new(index: usize, start: usize, data: Vec<Record>) -> Self {
        let end = start + data.len();
        Self {
            data,
            index,
            start,
            end,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn data(&self) -> &[Record] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take ownership of the records.
    pub fn into_data(self) -> Vec<Record> {
        self.data
    }
}

/// Output of running a task over one chunk. Exactly one per submitted chunk.
#[derive(Debug)]
pub struct WorkResult {
    /// Records produced by the task (empty when `error` is set)
    pub data: Vec<Record>,

    /// Index copied from the originating chunk; the sole reassembly key
    pub index: usize,

    /// Task failure, if any
    pub error: Option<PipelineError>,
}

impl WorkResult {
    pub fn success(index: usize, data: Vec<Record>) -> Self {
        Self {
            data,
            index,
            error: None,
        }
    }

    pub fn failure(index: usize, error: PipelineError) -> Self {
        Self {
            data: Vec::new(),
            index,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Groups consecutive records into chunks of at most `chunk_size`.
///
/// Boundaries depend only on `chunk_size` and the order records are pushed;
/// the final chunk may be short but is never empty.
#[derive(Debug)]
pub struct ChunkAssembler {
    chunk_size: usize,
    buffer: Vec<Record>,
    next_index: usize,
    offset: usize,
}

impl ChunkAssembler {
    /// Create an assembler. `chunk_size` must be > 0.
    pub fn new(chunk_size: usize) -> PipelineResult<Self> {
        if chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunk size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            next_index: 0,
            offset: 0,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks emitted so far.
    pub fn chunks_emitted(&self) -> usize {
        self.next_index
    }

    /// Records currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a record; returns a full chunk once `chunk_size` records are buffered.
    pub fn push(&mut self, record: Record) -> Option<Chunk> {
        self.buffer.push(record);
        if self.buffer.len() == self.chunk_size {
            Some(self.emit())
        } else {
            None
        }
    }

    /// Flush the remaining records, if any, as the final chunk.
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.emit())
        }
    }

    fn emit(&mut self) -> Chunk {
        let data = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        let chunk = Chunk::new(self.next_index, self.offset, data);
        self.next_index += 1;
        self.offset = chunk.end();
        chunk
    }

    /// Split an in-memory record list into chunks.
    pub fn assemble_all(
        records: impl IntoIterator<Item = Record>,
        chunk_size: usize,
    ) -> PipelineResult<Vec<Chunk>> {
        let mut assembler = Self::new(chunk_size)?;
        let mut chunks: Vec<Chunk> = records
            .into_iter()
            .filter_map(|r| assembler.push(r))
            .collect();
        chunks.extend(assembler.finish());
        Ok(chunks)
    }
}

/// Split one chunk into at most `parts` contiguous sub-chunks with indices
/// `0..parts`, preserving record order. Used to fan a single in-flight chunk
/// out across the worker pool.
pub fn split_chunk(chunk: Chunk, parts: usize) -> Vec<Chunk> {
    let parts = parts.max(1);
    if chunk.len() <= 1 || parts == 1 {
        let start = chunk.start();
        return vec![Chunk::new(0, start, chunk.into_data())];
    }

    let per_part = chunk.len().div_ceil(parts);
    let mut offset = chunk.start();
    let mut remaining = chunk.into_data().into_iter();
    let mut out = Vec::with_capacity(parts);

    loop {
        let data: Vec<Record> = remaining.by_ref().take(per_part).collect();
        if data.is_empty() {
            break;
        }
        let sub = Chunk::new(out.len(), offset, data);
        offset = sub.end();
        out.push(sub);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record_from;
    use serde_json::json;

    fn numbered(n: usize) -> Vec<Record> {
        (0..n).map(|i| record_from([("id", json!(i))])).collect()
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(ChunkAssembler::new(0).is_err());
    }

    #[test]
    fn test_exact_multiple() {
        let chunks = ChunkAssembler::assemble_all(numbered(9), 3).unwrap();
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index(), i);
            assert_eq!(chunk.len(), 3);
            assert_eq!(chunk.start(), i * 3);
            assert_eq!(chunk.end(), i * 3 + 3);
        }
    }

    #[test]
    fn test_short_final_chunk() {
        let chunks = ChunkAssembler::assemble_all(numbered(10), 4).unwrap();
        let sizes: Vec<usize> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(chunks[2].index(), 2);
        assert_eq!(chunks[2].start(), 8);
        assert_eq!(chunks[2].end(), 10);
    }

    #[test]
    fn test_empty_stream_emits_nothing() {
        let chunks = ChunkAssembler::assemble_all(Vec::new(), 5).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_push_and_finish() {
        let mut assembler = ChunkAssembler::new(2).unwrap();
        let mut records = numbered(3).into_iter();

        assert!(assembler.push(records.next().unwrap()).is_none());
        let first = assembler.push(records.next().unwrap()).unwrap();
        assert_eq!(first.index(), 0);
        assert!(assembler.push(records.next().unwrap()).is_none());
        assert_eq!(assembler.buffered(), 1);

        let last = assembler.finish().unwrap();
        assert_eq!(last.index(), 1);
        assert_eq!(last.len(), 1);
        assert!(assembler.finish().is_none());
        assert_eq!(assembler.chunks_emitted(), 2);
    }

    #[test]
    fn test_order_preserved() {
        let chunks = ChunkAssembler::assemble_all(numbered(7), 3).unwrap();
        let ids: Vec<u64> = chunks
            .iter()
            .flat_map(|c| c.data().iter().map(|r| r["id"].as_u64().unwrap()))
            .collect();
        assert_eq!(ids, (0..7).collect::<Vec<u64>>());
    }

    #[test]
    fn test_split_chunk() {
        let chunk = Chunk::new(5, 100, numbered(10));
        let parts = split_chunk(chunk, 3);

        let sizes: Vec<usize> = parts.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(parts[0].start(), 100);
        assert_eq!(parts[2].end(), 110);
        let indices: Vec<usize> = parts.iter().map(Chunk::index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_split_chunk_more_parts_than_records() {
        let parts = split_chunk(Chunk::new(0, 0, numbered(2)), 8);
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.len() == 1));
    }
}
