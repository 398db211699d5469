use super::Output;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// In-memory sink. Clones share the same buffer, so a caller can keep a
/// handle and read what a pipeline wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
    open: Arc<AtomicBool>,
    closes: Arc<AtomicUsize>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Number of `close` calls that found the sink open.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Output for MemoryOutput {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        self.lock().clear();
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write_chunk(&self, _cancel: &CancellationToken, data: &[u8]) -> PipelineResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PipelineError::output("output not initialized"));
        }
        self.lock().extend_from_slice(data);
        Ok(())
    }

    async fn close(&self) -> PipelineResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
