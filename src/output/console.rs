use super::{Output, Sink};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use tokio::io::{BufWriter, Stdout};
use tokio_util::sync::CancellationToken;

/// Writes to standard output through a buffer flushed on close.
pub struct ConsoleOutput {
    sink: Sink<BufWriter<Stdout>>,
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleOutput {
    pub fn new() -> Self {
        Self { sink: Sink::new() }
    }
}

#[async_trait]
impl Output for ConsoleOutput {
    fn name(&self) -> &str {
        "console"
    }

    async fn initialize(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.sink.open(BufWriter::new(tokio::io::stdout())).await
    }

    async fn write_chunk(&self, _cancel: &CancellationToken, data: &[u8]) -> PipelineResult<()> {
        self.sink.write(data).await
    }

    async fn close(&self) -> PipelineResult<()> {
        self.sink.close().await
    }
}
