use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{ByteStream, RangeFetcher, ReadAt};
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::retry::RetryPolicy;
use crate::storage::{ObjectLocation, ObjectStore};

/// How much of a remote archive to cache and how hard to try.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Largest tail window kept on local disk.
    pub local_size_limit: u64,
    /// Directory for the tail cache file.
    pub cache_dir: PathBuf,
    pub retry: RetryPolicy,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            local_size_limit: 400 * 1024 * 1024,
            cache_dir: std::env::temp_dir(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Random-access view of a ZIP archive held in object storage.
///
/// Must be [`initialize`](Self::initialize)d before any read; after that the
/// length is fixed for the reader's lifetime.
pub struct RemoteArchiveReader {
    fetcher: RangeFetcher,
    local_size_limit: u64,
}

impl RemoteArchiveReader {
    pub fn new(fetcher: RangeFetcher, local_size_limit: u64) -> Self {
        Self {
            fetcher,
            local_size_limit,
        }
    }

    /// Build a reader for `location`, reading through `store`.
    pub fn connect(
        store: Arc<dyn ObjectStore>,
        location: ObjectLocation,
        options: &ReaderOptions,
    ) -> Result<Self> {
        let remote = store.range_client(&location).kind(ErrorKind::Config)?;
        let fetcher = RangeFetcher::new(
            store,
            location,
            remote,
            options.retry,
            options.cache_dir.clone(),
        );
        Ok(Self::new(fetcher, options.local_size_limit))
    }

    /// Fetch the archive length and cache its tail. Idempotent once it
    /// has succeeded.
    pub async fn initialize(&self) -> Result<u64> {
        let size = self.fetcher.prepare(self.local_size_limit).await?;
        info!("archive {} is {} bytes", self.fetcher.location(), size);
        Ok(size)
    }

    /// Archive length established by [`initialize`](Self::initialize).
    /// Fails with [`ErrorKind::NotOpen`] before that and after close.
    pub fn length(&self) -> Result<u64> {
        self.fetcher.total_size().ok_or_else(|| {
            Error::msg(ErrorKind::NotOpen, "archive is not initialized or already closed")
        })
    }

    /// Stream bytes `[start, end)` of the archive.
    pub async fn open_range(&self, start: u64, end: u64) -> Result<ByteStream> {
        self.fetcher.open_range(start, end).await
    }

    pub fn fetcher(&self) -> &RangeFetcher {
        &self.fetcher
    }

    /// Release the local tail cache. No-op if never initialized or already closed.
    pub fn close(&self) {
        self.fetcher.close();
    }
}

#[async_trait]
impl ReadAt for RemoteArchiveReader {
    async fn read_range(&self, start: u64, end: u64) -> anyhow::Result<ByteStream> {
        Ok(self.open_range(start, end).await?)
    }

    /// Zero until initialized and after close; reads then fail with
    /// [`ErrorKind::NotOpen`].
    fn size(&self) -> u64 {
        self.fetcher.total_size().unwrap_or(0)
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<usize> {
        // Closed or never initialized: an error, not end of file.
        let size = self.length()?;
        if let Some(res) = self.fetcher.read_cached(offset, buf) {
            return Ok(res?);
        }

        let end = (offset + buf.len() as u64).min(size);
        if offset >= end {
            return Ok(0);
        }

        let mut stream = self.open_range(offset, end).await?;
        let want = (end - offset) as usize;
        let mut received = 0;
        while received < want {
            let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf[received..want]).await?;
            if n == 0 {
                break;
            }
            received += n;
        }
        Ok(received)
    }

    fn close(&self) {
        RemoteArchiveReader::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsObjectStore;

    async fn reader_over(bytes: &[u8], limit: u64) -> (tempfile::TempDir, RemoteArchiveReader) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bucket")).unwrap();
        std::fs::write(dir.path().join("bucket/archive.zip"), bytes).unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(dir.path()));
        let options = ReaderOptions {
            local_size_limit: limit,
            cache_dir: dir.path().to_path_buf(),
            retry: RetryPolicy::default(),
        };
        let reader = RemoteArchiveReader::connect(
            store,
            ObjectLocation::new("bucket", "local", "archive.zip"),
            &options,
        )
        .unwrap();
        (dir, reader)
    }

    #[tokio::test]
    async fn length_requires_initialization() {
        let (_dir, reader) = reader_over(b"0123456789", 4).await;
        assert_eq!(reader.length().unwrap_err().kind(), ErrorKind::NotOpen);
        assert_eq!(reader.initialize().await.unwrap(), 10);
        assert_eq!(reader.length().unwrap(), 10);
        assert_eq!(reader.fetcher().tail_window_start(), Some(6));
    }

    #[tokio::test]
    async fn reads_span_cache_and_remote() {
        let data: Vec<u8> = (0u8..=255).collect();
        let (_dir, reader) = reader_over(&data, 64).await;
        reader.initialize().await.unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(reader.read_at(240, &mut buf).await.unwrap(), 16);
        assert_eq!(&buf[..], &data[240..256]);
        assert_eq!(reader.fetcher().remote_requests(), 0);

        assert_eq!(reader.read_at(10, &mut buf).await.unwrap(), 16);
        assert_eq!(&buf[..], &data[10..26]);
        assert_eq!(reader.fetcher().remote_requests(), 1);
    }

    #[tokio::test]
    async fn reads_after_close_report_not_open() {
        let data: Vec<u8> = (0u8..100).collect();
        let (_dir, reader) = reader_over(&data, 16).await;

        let mut buf = [0u8; 30];
        let err = reader.read_at(10, &mut buf).await.unwrap_err();
        assert_eq!(err.downcast_ref::<Error>().unwrap().kind(), ErrorKind::NotOpen);

        reader.initialize().await.unwrap();
        assert_eq!(reader.read_at(10, &mut buf).await.unwrap(), 30);
        reader.close();

        for offset in [10, 90] {
            let err = reader.read_at(offset, &mut buf).await.unwrap_err();
            assert_eq!(err.downcast_ref::<Error>().unwrap().kind(), ErrorKind::NotOpen);
        }
        let err = reader.read_range(0, 10).await.err().unwrap();
        assert_eq!(err.downcast_ref::<Error>().unwrap().kind(), ErrorKind::NotOpen);
    }

    #[tokio::test]
    async fn close_before_initialize_is_harmless() {
        let (_dir, reader) = reader_over(b"abc", 4).await;
        reader.close();
        reader.close();
        assert!(reader.initialize().await.is_err());
    }
}
