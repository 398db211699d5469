//! Streaming pipeline orchestrator.
//!
//! Drives one source through the chunk assembler, the transform chain
//! (inline or on a [`WorkerPool`]), the formatter and the output, keeping a
//! single chunk in flight:
//!
//! ```text
//! initialize output → open iterator → start framing
//!   → [pull → assemble → transform → format → delimiter + bytes]*
//!   → end framing → close iterator → close output
//! ```
//!
//! The iterator and the output are always closed, whatever happened before.
//! The first failure is the one reported; failures while closing are logged
//! and attached to it.

use super::metrics::Metrics;
use super::worker_pool::WorkerPool;
use crate::error::{PipelineError, PipelineResult};
use crate::format::Formatter;
use crate::output::Output;
use crate::record::{split_chunk, Chunk, ChunkAssembler, Record, RecordPool, DEFAULT_CHUNK_SIZE};
use crate::source::{RecordIterator, Source, TrackedIterator};
use crate::transform::{Transform, TransformChain};
use bytes::BytesMut;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    OutputOpen,
    Streaming,
    Finalizing,
    Closed,
    Failed,
}

/// Counters for one completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub records_read: u64,
    pub records_written: u64,
    pub chunks_written: u64,
    pub chunks_skipped: u64,
    pub bytes_written: u64,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records read, {} written in {} chunks ({} skipped), {} bytes",
            self.records_read,
            self.records_written,
            self.chunks_written,
            self.chunks_skipped,
            self.bytes_written
        )
    }
}

/// Source-to-output streaming pipeline. Build with [`StreamingPipeline::builder`].
pub struct StreamingPipeline {
    source: Arc<dyn Source>,
    transforms: TransformChain,
    formatter: Arc<dyn Formatter>,
    output: Arc<dyn Output>,
    chunk_size: usize,
    worker_pool: Option<Arc<WorkerPool>>,
    record_pool: Arc<RecordPool>,
    metrics: Arc<Metrics>,
    span: tracing::Span,
    state: Mutex<PipelineState>,
    running: AtomicBool,
}

/// Releases the single-run claim on every exit from `run`.
struct RunClaim<'a>(&'a AtomicBool);

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl StreamingPipeline {
    pub fn builder() -> StreamingPipelineBuilder {
        StreamingPipelineBuilder::default()
    }

    pub fn state(&self) -> PipelineState {
        *self.lock_state()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn worker_pool(&self) -> Option<&Arc<WorkerPool>> {
        self.worker_pool.as_ref()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn record_pool(&self) -> &Arc<RecordPool> {
        &self.record_pool
    }

    /// Stream every record from the source to the output.
    ///
    /// Output already written when a failure occurs is not retracted.
    pub async fn run(&self, cancel: &CancellationToken) -> PipelineResult<PipelineStats> {
        let span = self.span.clone();
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> PipelineResult<PipelineStats> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::InvalidConfig(
                "pipeline is already running".to_string(),
            ));
        }
        let _running = RunClaim(&self.running);
        self.set_state(PipelineState::Init);

        tracing::info!(
            "Starting pipeline: source={}, stages={:?}, format={}, output={}, chunk_size={}, workers={}",
            self.source.name(),
            self.transforms.names(),
            self.formatter.name(),
            self.output.name(),
            self.chunk_size,
            self.worker_pool
                .as_ref()
                .map_or("inline".to_string(), |p| p.worker_count().to_string()),
        );

        let mut stats = PipelineStats::default();
        let mut iterator = None;
        let result = self.drive(cancel, &mut iterator, &mut stats).await;

        let mut cleanup = Vec::new();
        if let Some(mut iterator) = iterator {
            if let Err(e) = iterator.close().await {
                tracing::warn!("Failed to close source {}: {}", self.source.name(), e);
                cleanup.push(e);
            }
        }
        if let Err(e) = self.output.close().await {
            tracing::warn!("Failed to close output {}: {}", self.output.name(), e);
            cleanup.push(e);
        }

        let records_read = stats.records_read;
        let outcome = match result {
            Ok(()) => {
                let mut errors = cleanup.into_iter();
                match errors.next() {
                    None => Ok(stats),
                    Some(first) => Err(PipelineError::with_cleanup(first, errors.collect())),
                }
            }
            Err(primary) => Err(PipelineError::with_cleanup(primary, cleanup)),
        };

        match &outcome {
            Ok(stats) => {
                self.set_state(PipelineState::Closed);
                tracing::info!("Pipeline complete: {}", stats);
            }
            Err(e) => {
                self.set_state(PipelineState::Failed);
                self.metrics.add_failure();
                if e.is_cancellation() {
                    tracing::info!("Pipeline cancelled after {} records", records_read);
                } else {
                    tracing::error!("Pipeline failed: {}", e);
                }
            }
        }
        outcome
    }

    async fn drive(
        &self,
        cancel: &CancellationToken,
        iterator: &mut Option<TrackedIterator>,
        stats: &mut PipelineStats,
    ) -> PipelineResult<()> {
        cancellable(cancel, self.output.initialize(cancel)).await?;
        self.set_state(PipelineState::OutputOpen);

        let inner = cancellable(cancel, self.source.stream(cancel)).await?;
        let iterator = iterator.insert(TrackedIterator::new(inner));
        self.set_state(PipelineState::Streaming);

        let start = self.formatter.format_start()?;
        self.write(cancel, &start, stats).await?;

        let mut assembler = ChunkAssembler::new(self.chunk_size)?;
        let mut wrote_chunk = false;
        loop {
            let pull_start = Instant::now();
            let next = cancellable(cancel, iterator.next(cancel)).await?;
            self.metrics.add_source_time(pull_start.elapsed());

            let Some(record) = next else {
                break;
            };
            stats.records_read += 1;
            self.metrics.add_records_read(1);

            if let Some(chunk) = assembler.push(record) {
                self.emit_chunk(cancel, chunk, &mut wrote_chunk, stats).await?;
            }
        }
        if let Some(chunk) = assembler.finish() {
            self.emit_chunk(cancel, chunk, &mut wrote_chunk, stats).await?;
        }

        self.set_state(PipelineState::Finalizing);
        let end = self.formatter.format_end()?;
        self.write(cancel, &end, stats).await?;
        Ok(())
    }

    async fn emit_chunk(
        &self,
        cancel: &CancellationToken,
        chunk: Chunk,
        wrote_chunk: &mut bool,
        stats: &mut PipelineStats,
    ) -> PipelineResult<()> {
        let index = chunk.index();

        let transform_start = Instant::now();
        let records = self.transform(cancel, chunk).await?;
        self.metrics.add_transform_time(transform_start.elapsed());

        if records.is_empty() {
            tracing::trace!("Chunk {} empty after transforms, skipping", index);
            stats.chunks_skipped += 1;
            self.metrics.add_chunk_skipped();
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let format_start = Instant::now();
        let body = self.formatter.format_chunk(&records)?;
        self.metrics.add_format_time(format_start.elapsed());

        let delimiter = if *wrote_chunk {
            self.formatter.delimiter()
        } else {
            &[]
        };
        let mut payload = BytesMut::with_capacity(delimiter.len() + body.len());
        payload.extend_from_slice(delimiter);
        payload.extend_from_slice(&body);
        self.write(cancel, &payload, stats).await?;
        *wrote_chunk = true;

        let count = records.len() as u64;
        stats.chunks_written += 1;
        stats.records_written += count;
        self.metrics.add_chunk_written(count);
        tracing::trace!("Chunk {} written: {} records, {} bytes", index, count, payload.len());

        self.record_pool.put_all(records);
        Ok(())
    }

    /// Run the chain over one chunk, fanning it out across the worker pool
    /// when one is configured. Both paths yield records in the same order.
    async fn transform(&self, cancel: &CancellationToken, chunk: Chunk) -> PipelineResult<Vec<Record>> {
        if self.transforms.is_empty() {
            return Ok(chunk.into_data());
        }

        let Some(pool) = &self.worker_pool else {
            return cancellable(cancel, self.transforms.apply(cancel, chunk.into_data())).await;
        };

        let parts = split_chunk(chunk, pool.worker_count());
        let chain = self.transforms.clone();
        let results = pool
            .process_chunks(cancel, parts, move |token, part| {
                let chain = chain.clone();
                async move { chain.apply(&token, part.into_data()).await }
            })
            .await?;
        Ok(results.into_iter().flat_map(|r| r.data).collect())
    }

    async fn write(
        &self,
        cancel: &CancellationToken,
        data: &[u8],
        stats: &mut PipelineStats,
    ) -> PipelineResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let start = Instant::now();
        cancellable(cancel, self.output.write_chunk(cancel, data)).await?;
        self.metrics.add_write_time(start.elapsed());
        self.metrics.add_bytes_written(data.len() as u64);
        stats.bytes_written += data.len() as u64;
        Ok(())
    }

    fn set_state(&self, next: PipelineState) {
        *self.lock_state() = next;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Await `fut` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = PipelineResult<T>>,
) -> PipelineResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = fut => result,
    }
}

/// Builder for [`StreamingPipeline`]. Source, formatter and output are required.
#[derive(Default)]
pub struct StreamingPipelineBuilder {
    source: Option<Arc<dyn Source>>,
    transforms: TransformChain,
    formatter: Option<Arc<dyn Formatter>>,
    output: Option<Arc<dyn Output>>,
    chunk_size: Option<usize>,
    worker_pool: Option<Arc<WorkerPool>>,
    record_pool: Option<Arc<RecordPool>>,
    metrics: Option<Arc<Metrics>>,
    span: Option<tracing::Span>,
}

impl StreamingPipelineBuilder {
    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn transforms(mut self, transforms: TransformChain) -> Self {
        self.transforms = transforms;
        self
    }

    /// Append one stage to the chain.
    pub fn transform(mut self, stage: Arc<dyn Transform>) -> Self {
        self.transforms.push(stage);
        self
    }

    pub fn formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
        self.formatter = Some(formatter);
        self
    }

    pub fn output(mut self, output: Arc<dyn Output>) -> Self {
        self.output = Some(output);
        self
    }

    /// Records per chunk; defaults to [`DEFAULT_CHUNK_SIZE`].
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Run transforms on this pool instead of inline.
    pub fn worker_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.worker_pool = Some(pool);
        self
    }

    pub fn record_pool(mut self, pool: Arc<RecordPool>) -> Self {
        self.record_pool = Some(pool);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Span every log event of a run is recorded under.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> PipelineResult<StreamingPipeline> {
        let missing = |what: &str| PipelineError::InvalidConfig(format!("pipeline requires a {}", what));

        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "chunk size must be > 0".to_string(),
            ));
        }

        Ok(StreamingPipeline {
            source: self.source.ok_or_else(|| missing("source"))?,
            transforms: self.transforms,
            formatter: self.formatter.ok_or_else(|| missing("formatter"))?,
            output: self.output.ok_or_else(|| missing("output"))?,
            chunk_size,
            worker_pool: self.worker_pool,
            record_pool: self.record_pool.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_else(Metrics::new),
            span: self
                .span
                .unwrap_or_else(|| tracing::info_span!("pipeline")),
            state: Mutex::new(PipelineState::Init),
            running: AtomicBool::new(false),
        })
    }
}
