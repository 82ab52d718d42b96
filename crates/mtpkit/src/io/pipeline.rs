//! Pipelined transfers: overlap file I/O with USB I/O using two pooled
//! buffers, so the bus never waits on the disk and vice versa.

use std::path::Path;
use std::time::Instant;

use log::debug;
use tokio::sync::mpsc;

use super::pool::{BufferPool, PooledBuffer};
use super::{FileSink, Sink, Source, atomic_replace};
use crate::error::Error;

/// Two buffers: one in flight on the USB side while the other fills from
/// (or drains to) the filesystem.
const PIPELINE_DEPTH: usize = 2;

/// What a finished transfer reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferMetrics {
    pub bytes_transferred: u64,
    pub duration_seconds: f64,
}

/// Upload pipeline: a reader task fills buffers from the source while the
/// caller's `send_chunk` pushes them over USB.
pub struct PipelinedUpload;

impl PipelinedUpload {
    pub async fn run<S, F, P>(
        source: S,
        total_size: u64,
        chunk_size: usize,
        mut send_chunk: F,
        mut on_progress: P,
    ) -> Result<TransferMetrics, Error>
    where
        S: Source + 'static,
        F: AsyncFnMut(&[u8]) -> Result<(), Error>,
        P: FnMut(u64, u64),
    {
        let started = Instant::now();
        let pool = BufferPool::new(chunk_size.max(1), PIPELINE_DEPTH);
        let (tx, mut rx) = mpsc::channel::<Result<(PooledBuffer, usize), Error>>(PIPELINE_DEPTH);

        let reader_pool = pool.clone();
        let reader = tokio::spawn(async move {
            let mut source = source;
            let mut remaining = total_size;
            while remaining > 0 {
                let mut buf = reader_pool.acquire().await;
                let want = (buf.as_slice().len() as u64).min(remaining) as usize;
                let mut filled = 0usize;
                // Pack the chunk: short reads are common on pipes and
                // network mounts.
                while filled < want {
                    match source.read(&mut buf.as_mut_slice()[filled..want]).await {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                if filled == 0 {
                    let _ = tx
                        .send(Err(Error::Io(format!(
                            "source ended {remaining} bytes early"
                        ))))
                        .await;
                    return;
                }
                remaining -= filled as u64;
                if tx.send(Ok((buf, filled))).await.is_err() {
                    return; // consumer gave up
                }
            }
            let _ = source.close().await;
        });

        let mut sent = 0u64;
        let result = loop {
            match rx.recv().await {
                Some(Ok((buf, n))) => {
                    if let Err(e) = send_chunk(&buf.as_slice()[..n]).await {
                        break Err(e);
                    }
                    sent += n as u64;
                    on_progress(sent, total_size);
                    if sent >= total_size {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(e),
                None => {
                    break if sent == total_size {
                        Ok(())
                    } else {
                        Err(Error::Io(format!("upload ended at {sent} of {total_size} bytes")))
                    };
                }
            }
        };
        drop(rx);
        let _ = reader.await;
        result?;

        let duration_seconds = started.elapsed().as_secs_f64();
        debug!("pipelined upload: {sent} bytes in {duration_seconds:.2}s");
        Ok(TransferMetrics { bytes_transferred: sent, duration_seconds })
    }
}

/// Download pipeline: the caller's `receive_chunk` pulls bytes off USB while
/// a writer task drains finished buffers to a temp file, which is atomically
/// renamed over the destination at the end.
pub struct PipelinedDownload;

impl PipelinedDownload {
    pub async fn run<F, P>(
        dest: &Path,
        total_size: u64,
        chunk_size: usize,
        mut receive_chunk: F,
        mut on_progress: P,
    ) -> Result<TransferMetrics, Error>
    where
        F: AsyncFnMut(&mut [u8]) -> Result<usize, Error>,
        P: FnMut(u64, u64),
    {
        let started = Instant::now();
        let temp = temp_path(dest);
        let sink = FileSink::create(&temp).await?;

        let pool = BufferPool::new(chunk_size.max(1), PIPELINE_DEPTH);
        let (tx, mut rx) = mpsc::channel::<(PooledBuffer, usize)>(PIPELINE_DEPTH);

        let writer = tokio::spawn(async move {
            let mut sink = sink;
            while let Some((buf, n)) = rx.recv().await {
                sink.write(&buf.as_slice()[..n]).await?;
            }
            sink.close().await
        });

        let mut received = 0u64;
        let pull_result: Result<(), Error> = async {
            while received < total_size {
                let mut buf = pool.acquire().await;
                let want = (buf.as_slice().len() as u64).min(total_size - received) as usize;
                let n = receive_chunk(&mut buf.as_mut_slice()[..want]).await?;
                if n == 0 {
                    return Err(Error::Io(format!(
                        "device ended download at {received} of {total_size} bytes"
                    )));
                }
                received += n as u64;
                tx.send((buf, n))
                    .await
                    .map_err(|_| Error::Io("writer task stopped".to_string()))?;
                on_progress(received, total_size);
            }
            Ok(())
        }
        .await;

        drop(tx);
        let write_result = writer.await.map_err(|e| Error::Io(e.to_string()))?;
        if let Err(e) = pull_result.and(write_result) {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }

        atomic_replace(&temp, dest).await?;
        let duration_seconds = started.elapsed().as_secs_f64();
        debug!("pipelined download: {received} bytes in {duration_seconds:.2}s");
        Ok(TransferMetrics { bytes_transferred: received, duration_seconds })
    }
}

fn temp_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;

    #[tokio::test]
    async fn test_upload_delivers_everything_in_order() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let total = data.len() as u64;
        let mut seen = Vec::new();
        let mut progress = Vec::new();

        let metrics = PipelinedUpload::run(
            MemorySource::new(data.clone()),
            total,
            4096,
            async |chunk: &[u8]| {
                seen.extend_from_slice(chunk);
                Ok(())
            },
            |done, total| progress.push((done, total)),
        )
        .await
        .unwrap();

        assert_eq!(metrics.bytes_transferred, total);
        assert!(metrics.duration_seconds >= 0.0);
        assert_eq!(seen, data);
        assert_eq!(progress.last(), Some(&(total, total)));
    }

    #[tokio::test]
    async fn test_upload_short_source_errors() {
        let result = PipelinedUpload::run(
            MemorySource::new(vec![0u8; 10]),
            100,
            16,
            async |_chunk: &[u8]| Ok(()),
            |_, _| {},
        )
        .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_upload_send_error_propagates() {
        let result = PipelinedUpload::run(
            MemorySource::new(vec![0u8; 1000]),
            1000,
            100,
            async |_chunk: &[u8]| Err(Error::Busy),
            |_, _| {},
        )
        .await;
        assert_eq!(result.unwrap_err(), Error::Busy);
    }

    #[tokio::test]
    async fn test_download_writes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("photo.jpg");
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        let mut offset = 0usize;

        let metrics = PipelinedDownload::run(
            &dest,
            payload.len() as u64,
            4096,
            async |buf: &mut [u8]| {
                let n = buf.len().min(payload.len() - offset);
                buf[..n].copy_from_slice(&payload[offset..offset + n]);
                offset += n;
                Ok(n)
            },
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(metrics.bytes_transferred, payload.len() as u64);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
        assert!(!dir.path().join("photo.jpg.part").exists());
    }

    #[tokio::test]
    async fn test_download_failure_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("clip.mp4");

        let result = PipelinedDownload::run(
            &dest,
            1000,
            100,
            async |_buf: &mut [u8]| Err(Error::Transport(crate::transport::TransportError::Stall)),
            |_, _| {},
        )
        .await;

        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!dir.path().join("clip.mp4.part").exists());
    }
}
