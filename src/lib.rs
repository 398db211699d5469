//! Report Pipeline
//!
//! Streams records from a source through an ordered chain of transforms into
//! a formatter and an output sink, one chunk at a time, so memory stays
//! bounded by the chunk size rather than the data set.
//!
//! # Architecture
//!
//! - **Source**: lazy record iterators (CSV, JSON lines, in-memory, mock)
//! - **Transform**: an ordered chain of stages, optionally retried
//! - **Format**: start / chunk / end framing for JSON, JSON lines, CSV and YAML
//! - **Output**: console, file and in-memory sinks
//! - **Pipeline**: the streaming driver and a bounded, ordered, fail-fast
//!   worker pool for transform work
//!
//! # Usage
//!
//! ```no_run
//! use report_pipeline::{Config, run_pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_pipeline(config, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod output;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod transform;

pub use config::{Config, FormatConfig, OutputConfig, ProcessingConfig, SourceConfig, TransformConfig};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use format::Formatter;
pub use output::Output;
pub use pipeline::{Metrics, PipelineStats, StreamingPipeline, WorkerPool};
pub use record::{Chunk, Record, RecordPool, WorkResult};
pub use source::{RecordIterator, Source};
pub use transform::{Transform, TransformChain};

use anyhow::Result;
use pipeline::MetricsReporter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wire a pipeline from configuration.
///
/// Returns the worker pool separately when one is configured so the caller
/// can close it after the run.
pub fn build_pipeline(
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<(StreamingPipeline, Option<Arc<WorkerPool>>)> {
    let processing = &config.processing;
    let record_pool = Arc::new(RecordPool::new(processing.record_pool_capacity));

    let worker_pool = if processing.use_worker_pool {
        Some(Arc::new(WorkerPool::new(processing.worker_count)?))
    } else {
        None
    };

    let mut builder = StreamingPipeline::builder()
        .source(source::from_config(&config.source, record_pool.clone()))
        .transforms(transform::from_config(
            &config.transforms,
            &processing.retry,
            &record_pool,
        ))
        .formatter(format::from_config(&config.format))
        .output(output::from_config(&config.output))
        .chunk_size(processing.chunk_size)
        .record_pool(record_pool)
        .metrics(metrics);
    if let Some(pool) = &worker_pool {
        builder = builder.worker_pool(pool.clone());
    }

    Ok((builder.build()?, worker_pool))
}

/// Run the full pipeline with the given configuration.
pub async fn run_pipeline(config: Config, cancel: CancellationToken) -> Result<PipelineStats> {
    config.validate()?;
    tracing::info!("Starting report pipeline");

    let metrics = Metrics::new();
    let (pipeline, worker_pool) = build_pipeline(&config, metrics.clone())?;
    let processing = &config.processing;

    // Start metrics reporter if enabled
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let reporter_handle = if processing.enable_metrics {
        let reporter = MetricsReporter::new(metrics.clone(), processing.metrics_interval_secs);
        Some(tokio::spawn(reporter.run(shutdown_rx)))
    } else {
        drop(shutdown_rx);
        None
    };

    let result = pipeline.run(&cancel).await;

    if let Some(pool) = worker_pool {
        let timeout = Duration::from_secs(processing.close_timeout_secs);
        if let Err(e) = pool.close_with_timeout(timeout).await {
            tracing::warn!("Worker pool did not drain: {}", e);
        }
    }

    // Shutdown metrics reporter
    let _ = shutdown_tx.send(()).await;
    if let Some(handle) = reporter_handle {
        let _ = handle.await;
    }

    if processing.enable_metrics {
        // Console output owns stdout; keep the summary out of the report.
        if matches!(config.output, OutputConfig::Console) {
            tracing::info!("Summary: {}", metrics.snapshot());
        } else {
            MetricsReporter::new(metrics.clone(), processing.metrics_interval_secs)
                .print_summary();
        }

        if let Some(path) = &processing.metrics_output_path {
            if let Err(e) = metrics.snapshot().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {}", path, e);
            }
        }
    }

    Ok(result?)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_config(dir: &std::path::Path, format: FormatConfig) -> Config {
        let mut config = Config::example();
        config.source = SourceConfig::Mock { count: 30 };
        config.format = format;
        config.output = OutputConfig::File {
            path: dir.join("report.out").to_string_lossy().into_owned(),
            append: false,
        };
        config.processing.chunk_size = 7;
        config.processing.enable_metrics = false;
        config
    }

    #[tokio::test]
    async fn test_run_pipeline_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), FormatConfig::JsonLines);

        let stats = run_pipeline(config, CancellationToken::new()).await.unwrap();
        assert_eq!(stats.records_read, 30);
        // Ids divisible by 3 are inactive.
        assert_eq!(stats.records_written, 20);

        let written = std::fs::read_to_string(dir.path().join("report.out")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 20);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert!(first.get("email").is_none());
        assert_eq!(first["name"], "USER-00001");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_pipeline_with_worker_pool_matches_inline() {
        let inline_dir = tempfile::tempdir().unwrap();
        let pooled_dir = tempfile::tempdir().unwrap();

        let inline = file_config(inline_dir.path(), FormatConfig::Yaml);
        let mut pooled = file_config(pooled_dir.path(), FormatConfig::Yaml);
        pooled.processing.use_worker_pool = true;
        pooled.processing.worker_count = 3;

        run_pipeline(inline, CancellationToken::new()).await.unwrap();
        run_pipeline(pooled, CancellationToken::new()).await.unwrap();

        let a = std::fs::read(inline_dir.path().join("report.out")).unwrap();
        let b = std::fs::read(pooled_dir.path().join("report.out")).unwrap();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_run_pipeline_saves_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let metrics_path = dir.path().join("metrics.json");
        let mut config = file_config(dir.path(), FormatConfig::Json);
        config.processing.enable_metrics = true;
        config.processing.metrics_output_path = Some(metrics_path.to_string_lossy().into_owned());

        run_pipeline(config, CancellationToken::new()).await.unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&metrics_path).unwrap()).unwrap();
        assert_eq!(saved["records_read"], 30);
    }

    #[tokio::test]
    async fn test_run_pipeline_rejects_invalid_config() {
        let mut config = Config::example();
        config.processing.chunk_size = 0;
        assert!(run_pipeline(config, CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_run_pipeline_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path(), FormatConfig::Json);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_pipeline(config, cancel).await.unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_build_pipeline_worker_pool() {
        let mut config = Config::example();
        config.processing.use_worker_pool = true;
        config.processing.worker_count = 4;

        let (pipeline, pool) = build_pipeline(&config, Metrics::new()).unwrap();
        assert_eq!(pool.unwrap().worker_count(), 4);
        assert!(pipeline.worker_pool().is_some());
        assert_eq!(pipeline.chunk_size(), config.processing.chunk_size);
    }
}
