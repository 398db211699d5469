//! Error taxonomy for the streaming pipeline.
//!
//! Library components return [`PipelineError`]. Each variant identifies the
//! subsystem that failed so callers can tell "stopped because asked to"
//! ([`ErrorKind::Cancellation`]) apart from "stopped because something broke".
//!
//! ```text
//! PipelineError
//! ├── Cancelled                 -- token cancelled / deadline exceeded
//! ├── Source(..)                -- iterator or source open failure
//! ├── Processing { stage, .. }  -- transformation stage failure
//! ├── TaskPanic { index, .. }   -- worker task panicked (kind: Processing)
//! ├── Format(..)                -- serializer failure
//! ├── Output(..)                -- sink failure
//! ├── PoolClosed                -- work submitted after shutdown
//! ├── InvalidConfig(..)         -- rejected construction parameters
//! ├── CloseTimeout(..)          -- bounded close gave up waiting
//! └── WithCleanup { .. }        -- primary failure plus close-time failures
//! ```

use std::time::Duration;
use thiserror::Error;

/// Boxed cause carried by the stage-specific variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the library.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cancellation,
    Source,
    Processing,
    Format,
    Output,
    PoolClosed,
    Config,
    Timeout,
}

/// Terminal error reported by the worker pool and the streaming pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The cancellation token fired before the operation finished.
    #[error("pipeline cancelled")]
    Cancelled,

    /// The source failed to open or its iterator reported an I/O failure.
    #[error("source error: {0}")]
    Source(#[source] BoxError),

    /// A transformation stage failed.
    #[error("processing error in stage '{stage}': {source}")]
    Processing {
        stage: String,
        #[source]
        source: BoxError,
    },

    /// A worker task panicked; recovered and converted at the worker boundary.
    #[error("task panicked while processing chunk {index}: {message}")]
    TaskPanic { index: usize, message: String },

    /// The formatter failed to serialize records or framing.
    #[error("format error: {0}")]
    Format(#[source] BoxError),

    /// The output sink failed to open, write or close.
    #[error("output error: {0}")]
    Output(#[source] BoxError),

    /// Work was submitted to a worker pool after it was closed.
    #[error("worker pool is closed")]
    PoolClosed,

    /// Construction parameters were rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bounded close stopped waiting for in-flight work.
    #[error("timed out after {0:?} waiting for in-flight work")]
    CloseTimeout(Duration),

    /// The primary failure, with failures that happened afterwards during cleanup.
    #[error("{primary} (cleanup also failed: {})", join_errors(.cleanup))]
    WithCleanup {
        primary: Box<PipelineError>,
        cleanup: Vec<PipelineError>,
    },
}

fn join_errors(errors: &[PipelineError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PipelineError {
    /// Wrap a source-side failure.
    pub fn source_error(err: impl Into<BoxError>) -> Self {
        Self::Source(err.into())
    }

    /// Wrap a transformation failure for the named stage.
    pub fn processing(stage: impl Into<String>, err: impl Into<BoxError>) -> Self {
        Self::Processing {
            stage: stage.into(),
            source: err.into(),
        }
    }

    /// Wrap a formatter failure.
    pub fn format(err: impl Into<BoxError>) -> Self {
        Self::Format(err.into())
    }

    /// Wrap a sink failure.
    pub fn output(err: impl Into<BoxError>) -> Self {
        Self::Output(err.into())
    }

    /// Attach cleanup failures to a primary error. Returns the primary
    /// unchanged when there is nothing to attach.
    pub fn with_cleanup(primary: PipelineError, cleanup: Vec<PipelineError>) -> Self {
        if cleanup.is_empty() {
            return primary;
        }
        match primary {
            Self::WithCleanup {
                primary,
                cleanup: mut existing,
            } => {
                existing.extend(cleanup);
                Self::WithCleanup {
                    primary,
                    cleanup: existing,
                }
            }
            other => Self::WithCleanup {
                primary: Box::new(other),
                cleanup,
            },
        }
    }

    /// The error that caused the failure, skipping any cleanup wrapper.
    pub fn primary(&self) -> &PipelineError {
        match self {
            Self::WithCleanup { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Failures recorded during cleanup, if any.
    pub fn cleanup_errors(&self) -> &[PipelineError] {
        match self {
            Self::WithCleanup { cleanup, .. } => cleanup,
            _ => &[],
        }
    }

    /// Classify the primary failure.
    pub fn kind(&self) -> ErrorKind {
        match self.primary() {
            Self::Cancelled => ErrorKind::Cancellation,
            Self::Source(_) => ErrorKind::Source,
            Self::Processing { .. } | Self::TaskPanic { .. } => ErrorKind::Processing,
            Self::Format(_) => ErrorKind::Format,
            Self::Output(_) => ErrorKind::Output,
            Self::PoolClosed => ErrorKind::PoolClosed,
            Self::InvalidConfig(_) => ErrorKind::Config,
            Self::CloseTimeout(_) => ErrorKind::Timeout,
            Self::WithCleanup { .. } => unreachable!("primary() unwraps cleanup wrappers"),
        }
    }

    /// Whether the pipeline stopped because it was asked to.
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }
}
