use super::{Output, Sink};
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;

/// Writes to a local file, truncating it unless `append` is set. Missing
/// parent directories are created on initialize.
pub struct FileOutput {
    path: PathBuf,
    append: bool,
    sink: Sink<BufWriter<File>>,
}

impl FileOutput {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            append: false,
            sink: Sink::new(),
        }
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Output for FileOutput {
    fn name(&self) -> &str {
        "file"
    }

    async fn initialize(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(PipelineError::output)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .await
            .map_err(|e| {
                PipelineError::output(format!("failed to open {}: {}", self.path.display(), e))
            })?;

        tracing::debug!("Writing output to {}", self.path.display());
        self.sink.open(BufWriter::new(file)).await
    }

    async fn write_chunk(&self, _cancel: &CancellationToken, data: &[u8]) -> PipelineResult<()> {
        self.sink.write(data).await
    }

    async fn close(&self) -> PipelineResult<()> {
        self.sink.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");
        let cancel = CancellationToken::new();

        let output = FileOutput::new(&path);
        output.initialize(&cancel).await.unwrap();
        output.write_chunk(&cancel, b"hello ").await.unwrap();
        output.write_chunk(&cancel, b"world").await.unwrap();
        output.close().await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello world");

        let output = FileOutput::new(&path);
        output.initialize(&cancel).await.unwrap();
        output.write_chunk(&cancel, b"again").await.unwrap();
        output.close().await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "again");
    }

    #[tokio::test]
    async fn test_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        tokio::fs::write(&path, "a").await.unwrap();
        let cancel = CancellationToken::new();

        let output = FileOutput::new(&path).with_append(true);
        output.initialize(&cancel).await.unwrap();
        output.write_chunk(&cancel, b"b").await.unwrap();
        output.close().await.unwrap();
        output.close().await.unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a file.
        let output = FileOutput::new(dir.path());
        let err = output.initialize(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Output);
        output.close().await.unwrap();
    }
}
