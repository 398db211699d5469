//! Pipeline orchestration: the worker pool, the streaming driver and metrics.

mod metrics;
mod streaming;
mod worker_pool;


pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use streaming::{PipelineState, PipelineStats, StreamingPipeline, StreamingPipelineBuilder};
pub use worker_pool::WorkerPool;
