//! Byte sinks the pipeline writes framed output to.

mod console;
mod file;
mod memory;

pub use console::ConsoleOutput;
pub use file::FileOutput;
pub use memory::MemoryOutput;

use crate::config::OutputConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Destination for formatted bytes.
///
/// `close` must be idempotent and safe to call when `initialize` never ran
/// or failed.
#[async_trait]
pub trait Output: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self, cancel: &CancellationToken) -> PipelineResult<()>;

    async fn write_chunk(&self, cancel: &CancellationToken, data: &[u8]) -> PipelineResult<()>;

    async fn close(&self) -> PipelineResult<()>;
}

enum SinkState<W> {
    Unopened,
    Open(W),
    Closed,
}

/// Lifecycle shared by the writer-backed outputs.
pub(crate) struct Sink<W> {
    state: Mutex<SinkState<W>>,
}

impl<W> Sink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SinkState::Unopened),
        }
    }

    /// Install `writer`. A closed sink may be opened again for the next run.
    pub(crate) async fn open(&self, writer: W) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        if let SinkState::Open(_) = &*state {
            return Err(PipelineError::output("output already initialized"));
        }
        *state = SinkState::Open(writer);
        Ok(())
    }

    pub(crate) async fn write(&self, data: &[u8]) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        match &mut *state {
            SinkState::Open(writer) => writer.write_all(data).await.map_err(PipelineError::output),
            SinkState::Unopened => Err(PipelineError::output("output not initialized")),
            SinkState::Closed => Err(PipelineError::output("output is closed")),
        }
    }

    /// Flush and release the writer. Later calls are no-ops until the next
    /// `open`.
    pub(crate) async fn close(&self) -> PipelineResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SinkState::Closed) {
            SinkState::Open(mut writer) => writer.flush().await.map_err(PipelineError::output),
            SinkState::Unopened | SinkState::Closed => Ok(()),
        }
    }
}

pub fn from_config(config: &OutputConfig) -> Arc<dyn Output> {
    match config {
        OutputConfig::Console => Arc::new(ConsoleOutput::new()),
        OutputConfig::File { path, append } => {
            Arc::new(FileOutput::new(path).with_append(*append))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_lifecycle() {
        let sink: Sink<Vec<u8>> = Sink::new();
        assert!(sink.write(b"early").await.is_err());

        sink.open(Vec::new()).await.unwrap();
        sink.write(b"abc").await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert!(sink.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_sink_reopens_after_close() {
        let sink: Sink<Vec<u8>> = Sink::new();
        sink.open(Vec::new()).await.unwrap();
        assert!(sink.open(Vec::new()).await.is_err());
        sink.close().await.unwrap();

        sink.open(Vec::new()).await.unwrap();
        sink.write(b"second").await.unwrap();
        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_without_open() {
        let sink: Sink<Vec<u8>> = Sink::new();
        sink.close().await.unwrap();
    }
}
