//! Bounded-memory writer with backpressure.
//!
//! [`BoundedWriter`] wraps an async byte sink and batches small writes into
//! a single buffer of at most `batch_bytes`. When a write would overflow the
//! buffer, the buffer is handed to the sink first and the caller is
//! suspended until the sink has accepted it. That await is the only place
//! the export pass waits on disk, and it guarantees that no more than one
//! buffer generation of unflushed data is ever held in memory.
//!
//! Payloads larger than the batch size skip the buffer and go straight to
//! the sink, so a single 80 MiB record does not double its footprint.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{ExportError, Result};

/// Default batch size for shard writers.
pub const DEFAULT_BATCH_BYTES: usize = 1024 * 1024;

pub struct BoundedWriter<W> {
    path: PathBuf,
    sink: W,
    buf: Vec<u8>,
    batch_bytes: usize,
    bytes_written: u64,
    closed: bool,
}

impl BoundedWriter<File> {
    /// Create (or truncate) a file and wrap it.
    pub async fn create(path: &Path, batch_bytes: usize) -> Result<Self> {
        let file = File::create(path)
            .await
            .map_err(|e| ExportError::writer(path, e))?;
        Ok(Self::new(path, file, batch_bytes))
    }
}

impl<W: AsyncWrite + Unpin> BoundedWriter<W> {
    /// Wrap an existing sink. `path` is only used for error reporting.
    pub fn new(path: impl Into<PathBuf>, sink: W, batch_bytes: usize) -> Self {
        let batch_bytes = batch_bytes.max(1);
        Self {
            path: path.into(),
            sink,
            buf: Vec::with_capacity(batch_bytes.min(64 * 1024)),
            batch_bytes,
            bytes_written: 0,
            closed: false,
        }
    }

    pub async fn write(&mut self, text: &str) -> Result<()> {
        self.write_bytes(text.as_bytes()).await
    }

    /// Append bytes, suspending until the sink is ready whenever the batch
    /// buffer would overflow.
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ExportError::writer(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer already closed"),
            ));
        }

        if self.buf.len() + data.len() > self.batch_bytes {
            self.flush_buffer().await?;
        }

        if data.len() >= self.batch_bytes {
            self.sink
                .write_all(data)
                .await
                .map_err(|e| ExportError::writer(&self.path, e))?;
        } else {
            self.buf.extend_from_slice(data);
        }

        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush buffered data, flush the sink, and shut it down.
    ///
    /// Idempotent: once called, further calls return `Ok(())` without
    /// touching the sink.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let flushed = self.flush_buffer().await;
        let finished = match self.sink.flush().await {
            Ok(()) => self.sink.shutdown().await,
            Err(e) => Err(e),
        };

        flushed?;
        finished.map_err(|e| ExportError::writer(&self.path, e))
    }

    async fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let result = self.sink.write_all(&self.buf).await;
        self.buf.clear();
        result.map_err(|e| ExportError::writer(&self.path, e))
    }

    /// Total bytes accepted by [`write_bytes`](Self::write_bytes).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Bytes currently held in the batch buffer.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }
}

impl<W> Drop for BoundedWriter<W> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!(
                path = %self.path.display(),
                pending = self.buf.len(),
                "writer dropped without close"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn small_writes_stay_buffered_until_close() {
        let mut w = BoundedWriter::new("mem", Vec::new(), 1024);
        w.write("hello ").await.unwrap();
        w.write("world").await.unwrap();
        assert!(w.get_ref().is_empty());
        assert_eq!(w.buffered(), 11);

        w.close().await.unwrap();
        assert_eq!(w.get_ref().as_slice(), b"hello world");
        assert_eq!(w.bytes_written(), 11);
    }

    #[tokio::test]
    async fn buffer_never_exceeds_one_batch() {
        let mut w = BoundedWriter::new("mem", Vec::new(), 256);
        let piece = "x".repeat(100);
        for _ in 0..50 {
            w.write(&piece).await.unwrap();
            assert!(w.buffered() <= 256, "buffered {} > batch", w.buffered());
        }
        w.close().await.unwrap();
        assert_eq!(w.get_ref().len(), 5000);
    }

    #[tokio::test]
    async fn oversized_payload_bypasses_buffer() {
        let mut w = BoundedWriter::new("mem", Vec::new(), 16);
        w.write("ab").await.unwrap();
        let big = "z".repeat(100);
        w.write(&big).await.unwrap();
        assert_eq!(w.buffered(), 0);
        assert_eq!(w.get_ref().len(), 102);
        assert!(w.get_ref().starts_with(b"ab"));
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_writes() {
        let mut w = BoundedWriter::new("mem", Vec::new(), 64);
        w.write("data").await.unwrap();
        w.close().await.unwrap();
        w.close().await.unwrap();
        assert!(w.is_closed());

        let err = w.write("more").await.unwrap_err();
        assert!(matches!(err, ExportError::Writer { .. }));
        assert_eq!(w.get_ref().as_slice(), b"data");
    }

    #[tokio::test]
    async fn slow_sink_suspends_producer_without_losing_data() {
        // The duplex pipe only holds 16 bytes, so every flush waits on the reader.
        let (tx, mut rx) = tokio::io::duplex(16);
        let producer = tokio::spawn(async move {
            let mut w = BoundedWriter::new("pipe", tx, 32);
            for i in 0..200 {
                w.write(&format!("{:04},", i)).await.unwrap();
                assert!(w.buffered() <= 32);
            }
            w.close().await.unwrap();
        });

        let mut received = String::new();
        rx.read_to_string(&mut received).await.unwrap();
        producer.await.unwrap();

        let expected: String = (0..200).map(|i| format!("{:04},", i)).collect();
        assert_eq!(received, expected);
    }
}
