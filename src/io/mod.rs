mod fetcher;
mod local;
#[cfg(test)]
mod memory;
mod reader;

pub use fetcher::RangeFetcher;
pub use local::TailCache;
pub use reader::{ReaderOptions, RemoteArchiveReader};

#[cfg(test)]
pub(crate) use memory::MemoryArchive;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// An owned, sendable byte stream.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// A stream that is immediately at EOF.
pub fn empty_stream() -> ByteStream {
    Box::pin(tokio::io::empty())
}

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Stream the bytes in `[start, end)`.
    async fn read_range(&self, start: u64, end: u64) -> Result<ByteStream>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Read data at the specified offset into the buffer.
    ///
    /// Returns fewer bytes than requested only at the end of the source.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }

        let end = (offset + buf.len() as u64).min(size);
        let want = (end - offset) as usize;
        let mut stream = self.read_range(offset, end).await?;

        let mut received = 0;
        while received < want {
            let n = stream.read(&mut buf[received..want]).await?;
            if n == 0 {
                break;
            }
            received += n;
        }
        Ok(received)
    }

    /// Release whatever the source holds open. Must be idempotent.
    fn close(&self) {}
}

/// Counts the bytes that pass through a reader.
pub struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared handle to the running count, readable after the reader is consumed.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let read = buf.filled().len() - before;
            this.count.fetch_add(read as u64, Ordering::Relaxed);
        }
        res
    }
}
