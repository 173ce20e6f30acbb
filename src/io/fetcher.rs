use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::bail;
use tracing::{debug, info};

use super::{ByteStream, TailCache, empty_stream};
use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::retry::{RetryPolicy, with_retry};
use crate::storage::{ObjectLocation, ObjectStore, RangeClient};

enum FetchState {
    Uninitialized,
    Ready { total_size: u64, tail: Arc<TailCache> },
    Closed,
}

/// Serves byte ranges of one remote object, preferring a locally cached tail.
///
/// After [`prepare`](Self::prepare) the tail window `[tail_start, total_size)`
/// lives in a temporary file. Ranges starting inside the window are sliced
/// from that file; everything else becomes a remote range request.
pub struct RangeFetcher {
    store: Arc<dyn ObjectStore>,
    location: ObjectLocation,
    remote: Arc<dyn RangeClient>,
    retry: RetryPolicy,
    cache_dir: PathBuf,
    state: RwLock<FetchState>,
    remote_requests: AtomicU64,
}

impl RangeFetcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        location: ObjectLocation,
        remote: Arc<dyn RangeClient>,
        retry: RetryPolicy,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            location,
            remote,
            retry,
            cache_dir,
            state: RwLock::new(FetchState::Uninitialized),
            remote_requests: AtomicU64::new(0),
        }
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    /// Fetch the object length and download its last `size_limit` bytes.
    ///
    /// An object reporting zero length is downloaded whole and the
    /// downloaded length becomes its size. Calling this again after success
    /// returns the cached size.
    pub async fn prepare(&self, size_limit: u64) -> Result<u64> {
        if let Some(total_size) = self.total_size() {
            return Ok(total_size);
        }
        if self.is_closed() {
            return Err(not_open());
        }

        let meta = with_retry(self.retry, "fetch archive metadata", || {
            self.store.head_object(&self.location)
        })
        .await
        .kind(ErrorKind::MetadataFetch)?;

        let mut total_size = meta.content_length;
        let tail_start = total_size.saturating_sub(size_limit);
        let range = (total_size > 0).then_some((tail_start, total_size));

        let (file, downloaded) = with_retry(self.retry, "download archive tail", || {
            self.download(range)
        })
        .await
        .kind(ErrorKind::TailDownload)?;

        if total_size == 0 {
            total_size = downloaded;
        }
        info!(
            "cached bytes {}..{} of {} locally",
            tail_start, total_size, self.location
        );

        let tail = Arc::new(TailCache::new(file, tail_start, downloaded));
        let mut state = self.write_state();
        if matches!(*state, FetchState::Closed) {
            return Err(not_open());
        }
        *state = FetchState::Ready { total_size, tail };
        Ok(total_size)
    }

    async fn download(&self, range: Option<(u64, u64)>) -> anyhow::Result<(tempfile::NamedTempFile, u64)> {
        let temp = tempfile::Builder::new()
            .prefix("unzip-tail-")
            .tempfile_in(&self.cache_dir)?;
        let mut out = tokio::fs::File::from_std(temp.reopen()?);
        let written = self.store.get_object(&self.location, range, &mut out).await?;

        if let Some((start, end)) = range
            && written != end - start
        {
            bail!("tail download returned {} bytes, expected {}", written, end - start);
        }
        Ok((temp, written))
    }

    /// Authoritative object length, once prepared.
    pub fn total_size(&self) -> Option<u64> {
        match &*self.read_state() {
            FetchState::Ready { total_size, .. } => Some(*total_size),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.read_state(), FetchState::Closed)
    }

    /// First byte offset served from the local cache, once prepared.
    pub fn tail_window_start(&self) -> Option<u64> {
        match &*self.read_state() {
            FetchState::Ready { tail, .. } => Some(tail.start()),
            _ => None,
        }
    }

    /// Number of ranges served remotely so far.
    pub fn remote_requests(&self) -> u64 {
        self.remote_requests.load(Ordering::Relaxed)
    }

    /// Stream bytes `[start, end)` of the object.
    ///
    /// Remote ranges are not retried here.
    pub async fn open_range(&self, start: u64, end: u64) -> Result<ByteStream> {
        let (total_size, tail) = self.ready()?;
        let end = end.min(total_size);
        if start >= end {
            return Ok(empty_stream());
        }

        if start >= tail.start() {
            debug!("range {}..{} served from local tail", start, end);
            return tail
                .open_range(start - tail.start(), end - tail.start())
                .await
                .kind(ErrorKind::LocalCache);
        }

        self.remote_requests.fetch_add(1, Ordering::Relaxed);
        self.remote
            .open_range(start, end)
            .await
            .kind(ErrorKind::RangeRequest)
    }

    /// Positional read from the local tail, when `offset` falls inside it.
    pub fn read_cached(&self, offset: u64, buf: &mut [u8]) -> Option<Result<usize>> {
        let (total_size, tail) = self.ready().ok()?;
        if offset < tail.start() || offset >= total_size {
            return None;
        }
        Some(
            tail.read_at(offset - tail.start(), buf)
                .kind(ErrorKind::LocalCache),
        )
    }

    /// Drop the local cache. Safe to call at any point, any number of times.
    pub fn close(&self) {
        let mut state = self.write_state();
        if !matches!(*state, FetchState::Closed) {
            debug!("closing range fetcher for {}", self.location);
        }
        *state = FetchState::Closed;
    }

    fn ready(&self) -> Result<(u64, Arc<TailCache>)> {
        match &*self.read_state() {
            FetchState::Ready { total_size, tail } => Ok((*total_size, tail.clone())),
            _ => Err(not_open()),
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, FetchState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, FetchState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn not_open() -> Error {
    Error::msg(ErrorKind::NotOpen, "archive reader is not initialized or already closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ObjectMeta, PutResult};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// In-memory object with a configurable number of failing metadata calls.
    struct FakeStore {
        data: Vec<u8>,
        head_failures: Mutex<u32>,
        head_calls: AtomicU64,
        remote: Arc<CountingRemote>,
    }

    struct CountingRemote {
        data: Vec<u8>,
        calls: AtomicU64,
    }

    #[async_trait]
    impl RangeClient for CountingRemote {
        async fn open_range(&self, start: u64, end: u64) -> anyhow::Result<ByteStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let slice = self.data[start as usize..end as usize].to_vec();
            Ok(Box::pin(std::io::Cursor::new(slice)))
        }
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn head_object(&self, _: &ObjectLocation) -> anyhow::Result<ObjectMeta> {
            self.head_calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.head_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                bail!("throttled");
            }
            Ok(ObjectMeta {
                content_length: self.data.len() as u64,
                etag: None,
            })
        }

        async fn get_object(
            &self,
            _: &ObjectLocation,
            range: Option<(u64, u64)>,
            out: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> anyhow::Result<u64> {
            let (start, end) = range.unwrap_or((0, self.data.len() as u64));
            out.write_all(&self.data[start as usize..end as usize]).await?;
            out.flush().await?;
            Ok(end - start)
        }

        async fn put_object(&self, _: &ObjectLocation, _: ByteStream, _: u64) -> anyhow::Result<PutResult> {
            bail!("read-only")
        }

        fn range_client(&self, _: &ObjectLocation) -> anyhow::Result<Arc<dyn RangeClient>> {
            Ok(self.remote.clone())
        }
    }

    fn make_fetcher(size: usize, head_failures: u32) -> (RangeFetcher, Arc<FakeStore>) {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let remote = Arc::new(CountingRemote {
            data: data.clone(),
            calls: AtomicU64::new(0),
        });
        let store = Arc::new(FakeStore {
            data,
            head_failures: Mutex::new(head_failures),
            head_calls: AtomicU64::new(0),
            remote: remote.clone(),
        });
        let loc = ObjectLocation::new("b", "r", "a.zip");
        let fetcher = RangeFetcher::new(
            store.clone(),
            loc,
            remote,
            RetryPolicy::default(),
            std::env::temp_dir(),
        );
        (fetcher, store)
    }

    async fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn tail_window_follows_size_limit() {
        for (size, limit) in [(1000usize, 300u64), (1000, 1000), (1000, 5000), (1, 0)] {
            let (fetcher, _) = make_fetcher(size, 0);
            let total = fetcher.prepare(limit).await.unwrap();
            assert_eq!(total, size as u64);
            assert_eq!(
                fetcher.tail_window_start(),
                Some((size as u64).saturating_sub(limit))
            );
        }
    }

    #[tokio::test]
    async fn tail_ranges_never_go_remote() {
        let (fetcher, store) = make_fetcher(1000, 0);
        fetcher.prepare(300).await.unwrap();

        let bytes = read_all(fetcher.open_range(700, 1000).await.unwrap()).await;
        assert_eq!(bytes, store.data[700..1000]);
        let bytes = read_all(fetcher.open_range(950, 2000).await.unwrap()).await;
        assert_eq!(bytes, store.data[950..1000]);
        assert_eq!(fetcher.remote_requests(), 0);
        assert_eq!(store.remote.calls.load(Ordering::SeqCst), 0);

        let bytes = read_all(fetcher.open_range(100, 800).await.unwrap()).await;
        assert_eq!(bytes, store.data[100..800]);
        assert_eq!(fetcher.remote_requests(), 1);
    }

    #[tokio::test]
    async fn metadata_retried_until_success() {
        let (fetcher, store) = make_fetcher(500, 2);
        assert_eq!(fetcher.prepare(100).await.unwrap(), 500);
        assert_eq!(store.head_calls.load(Ordering::SeqCst), 3);
        assert_eq!(fetcher.tail_window_start(), Some(400));
    }

    #[tokio::test]
    async fn metadata_failure_exhausts_retries() {
        let (fetcher, store) = make_fetcher(500, 5);
        let err = fetcher.prepare(100).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataFetch);
        assert_eq!(store.head_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_reads() {
        let (fetcher, _) = make_fetcher(100, 0);
        fetcher.close();
        fetcher.close();
        assert_eq!(fetcher.prepare(10).await.unwrap_err().kind(), ErrorKind::NotOpen);

        let (fetcher, _) = make_fetcher(100, 0);
        fetcher.prepare(10).await.unwrap();
        fetcher.close();
        let err = fetcher.open_range(95, 100).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotOpen);
        fetcher.close();
    }
}
