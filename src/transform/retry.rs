//! Retry decorator for transformation stages.

use super::Transform;
use crate::config::RetryConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::record::Record;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Re-runs a failed stage with exponential backoff.
///
/// Each attempt gets its own copy of the input batch. Cancellation is never
/// retried and interrupts the backoff sleep.
pub struct RetryTransform {
    inner: Arc<dyn Transform>,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryTransform {
    pub fn new(inner: Arc<dyn Transform>, config: &RetryConfig) -> Self {
        Self {
            inner,
            max_attempts: config.max_retries.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

#[async_trait]
impl Transform for RetryTransform {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        records: Vec<Record>,
    ) -> PipelineResult<Vec<Record>> {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            // The last attempt can consume the batch instead of cloning it.
            let input = if attempt + 1 >= self.max_attempts {
                return self.inner.process(cancel, records).await;
            } else {
                records.clone()
            };

            match self.inner.process(cancel, input).await {
                Ok(out) => return Ok(out),
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(
                        "Stage {} attempt {} failed: {}, retrying in {:?}",
                        self.inner.name(),
                        attempt,
                        e,
                        backoff
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }
    }
}
