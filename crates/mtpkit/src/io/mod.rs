//! Platform file I/O as the engine consumes it: byte sinks and sources with
//! explicit close, plus atomic replace for resumable downloads.

mod pipeline;
mod pool;

pub use pipeline::{PipelinedDownload, PipelinedUpload, TransferMetrics};
pub use pool::{BufferPool, PooledBuffer};

use std::future::Future;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::Error;

/// A byte sink (local file, pipe, memory buffer).
pub trait Sink: Send {
    /// Writes the whole buffer; returns the byte count written.
    fn write(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Flushes and closes. Must be called; dropping without closing may lose
    /// buffered bytes.
    fn close(self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// A byte source with a known size.
pub trait Source: Send {
    /// Reads into `buf`; returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<usize, Error>> + Send;

    fn file_size(&self) -> u64;

    fn close(self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Renames `temp` over `final_path`. Guarantees `temp` is gone afterwards,
/// even when the rename fails.
pub async fn atomic_replace(temp: &Path, final_path: &Path) -> Result<(), Error> {
    match tokio::fs::rename(temp, final_path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(temp).await;
            Err(Error::Io(format!(
                "rename {} -> {}: {e}",
                temp.display(),
                final_path.display()
            )))
        }
    }
}

/// File-backed sink, append-positioned at open time.
pub struct FileSink {
    file: tokio::fs::File,
}

impl FileSink {
    pub async fn create(path: &Path) -> Result<Self, Error> {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;
        Ok(Self { file })
    }

    /// Opens for appending, returning the sink and the existing length.
    /// Creates the file when missing. This is the resume entry point.
    pub async fn append(path: &Path) -> Result<(Self, u64), Error> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;
        let len = file
            .seek(std::io::SeekFrom::End(0))
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok((Self { file }, len))
    }
}

impl Sink for FileSink {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.file.write_all(buf).await.map_err(|e| Error::Io(e.to_string()))?;
        Ok(buf.len())
    }

    async fn close(mut self) -> Result<(), Error> {
        self.file.flush().await.map_err(|e| Error::Io(e.to_string()))?;
        self.file.sync_all().await.map_err(|e| Error::Io(e.to_string()))
    }
}

/// File-backed source.
pub struct FileSource {
    file: tokio::fs::File,
    size: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> Result<Self, Error> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::Io(format!("{}: {e}", path.display())))?;
        let size = file.metadata().await.map_err(|e| Error::Io(e.to_string()))?.len();
        Ok(Self { file, size })
    }
}

impl Source for FileSource {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.file.read(buf).await.map_err(|e| Error::Io(e.to_string()))
    }

    fn file_size(&self) -> u64 {
        self.size
    }

    async fn close(self) -> Result<(), Error> {
        Ok(())
    }
}

/// In-memory sink for tests and small reads.
#[derive(Default)]
pub struct MemorySink {
    pub data: Vec<u8>,
}

impl Sink for MemorySink {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    async fn close(self) -> Result<(), Error> {
        Ok(())
    }
}

/// In-memory source for tests and uploads of generated content.
pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl Source for MemorySource {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = (self.data.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn file_size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn close(self) -> Result<(), Error> {
        Ok(())
    }
}
