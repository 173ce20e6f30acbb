//! Archive-to-bucket extraction runs.
//!
//! An [`Unzipper`] opens one ZIP archive held in object storage, lists it
//! once, and re-uploads every entry as its own object through a
//! [`TaskManager`]. Archive-level failures abort the run before any upload
//! starts; entry-level failures are recorded per task.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::io::{CountingReader, ReaderOptions, RemoteArchiveReader};
use crate::storage::{ObjectLocation, ObjectStore};
use crate::task::{MemoryBudget, TaskManager, TaskRecord, detect_total_memory};
use crate::zip::{
    AllowList, ArchiveEntry, ArchiveIndex, CentralDirectory, ChardetngDetector, FilenameDecoder,
    IndexOptions, ZipEngine,
};

/// Largest single object the destination accepts.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Working buffer assumed per concurrent upload.
pub const DEFAULT_TASK_BUFFER: u64 = 64 * 1024 * 1024;

pub const DEFAULT_RESERVE_RATE: f64 = 0.2;

pub const DEFAULT_MAX_CONCURRENCY: usize = 64;

/// Everything one extraction run needs to know.
#[derive(Debug, Clone)]
pub struct UnzipConfig {
    /// The archive to extract.
    pub source: ObjectLocation,
    pub target_bucket: String,
    pub target_region: String,
    /// Key prefix every extracted object is placed under.
    pub target_prefix: String,
    /// Nest entries under the archive's base name.
    pub extra_root_dir: bool,
    /// Leave directory entries out instead of uploading empty markers.
    pub skip_directories: bool,
    pub max_file_size: u64,
    pub reader: ReaderOptions,
    pub index: IndexOptions,
    /// Total memory to size the batch from. Detected when `None`.
    pub memory_bytes: Option<u64>,
    pub task_buffer_bytes: u64,
    pub reserve_rate: f64,
    pub max_concurrency: usize,
    /// Encodings accepted for file names besides the built-in list.
    pub extra_encodings: Vec<String>,
}

impl UnzipConfig {
    /// Extract `source` next to itself, with default limits.
    pub fn new(source: ObjectLocation) -> Self {
        Self {
            target_bucket: source.bucket.clone(),
            target_region: source.region.clone(),
            source,
            target_prefix: String::new(),
            extra_root_dir: false,
            skip_directories: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            reader: ReaderOptions::default(),
            index: IndexOptions::default(),
            memory_bytes: None,
            task_buffer_bytes: DEFAULT_TASK_BUFFER,
            reserve_rate: DEFAULT_RESERVE_RATE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            extra_encodings: Vec::new(),
        }
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        MemoryBudget {
            total_bytes: self.memory_bytes.unwrap_or_else(detect_total_memory),
            per_task_bytes: self.task_buffer_bytes,
            reserve_rate: self.reserve_rate,
            max_concurrency: self.max_concurrency,
        }
    }

    fn decoder(&self) -> FilenameDecoder {
        FilenameDecoder::new(
            Box::new(ChardetngDetector),
            AllowList::with_extra(self.extra_encodings.iter().cloned()),
        )
    }
}

/// One uploaded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub key: String,
    pub bytes: u64,
    pub etag: Option<String>,
}

pub type UnzipRecord = TaskRecord<ArchiveEntry, UploadResult>;

type RemoteIndex = ArchiveIndex<CentralDirectory<RemoteArchiveReader>>;

/// Extracts one archive into a bucket.
pub struct Unzipper {
    config: UnzipConfig,
    store: Arc<dyn ObjectStore>,
    token: CancellationToken,
    archive: Mutex<Option<Arc<RemoteArchiveReader>>>,
    index: Mutex<Option<Arc<RemoteIndex>>>,
}

impl Unzipper {
    pub fn new(config: UnzipConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            token: CancellationToken::new(),
            archive: Mutex::new(None),
            index: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &UnzipConfig {
        &self.config
    }

    /// Extract the archive, returning one record per scheduled entry.
    ///
    /// # Errors
    ///
    /// Fails only when the archive itself cannot be read; per-entry failures
    /// are inside the returned records.
    pub async fn run(&self) -> Result<Vec<UnzipRecord>> {
        check_extension(&self.config.source.key)?;
        let batch_limit = self.config.memory_budget().batch_limit();
        info!(
            "extracting {} with up to {} concurrent uploads",
            self.config.source, batch_limit
        );

        let reader = self.connect().await?;
        let result = self.extract(reader.clone(), batch_limit).await;
        self.release();
        result
    }

    /// List the archive without uploading anything.
    pub async fn list(&self) -> Result<Vec<ArchiveEntry>> {
        check_extension(&self.config.source.key)?;
        let reader = self.connect().await?;
        let result = async {
            let index = self.open_index(reader).await?;
            let entries = index.enumerate_entries().await;
            index.close();
            entries
        }
        .await;
        self.release();
        result
    }

    /// Stop scheduling uploads and close the archive.
    ///
    /// Uploads already running are not awaited. Streams they have open keep
    /// flowing; any stream they open from now on fails with
    /// [`ErrorKind::NotOpen`].
    pub fn cancel(&self) {
        self.token.cancel();
        self.release();
    }

    async fn connect(&self) -> Result<Arc<RemoteArchiveReader>> {
        if self.token.is_cancelled() {
            return Err(Error::msg(ErrorKind::Cancelled, "run cancelled before start"));
        }
        let reader = Arc::new(RemoteArchiveReader::connect(
            self.store.clone(),
            self.config.source.clone(),
            &self.config.reader,
        )?);
        lock(&self.archive).replace(reader.clone());

        if let Err(e) = reader.initialize().await {
            self.release();
            return Err(e);
        }
        Ok(reader)
    }

    async fn open_index(&self, reader: Arc<RemoteArchiveReader>) -> Result<Arc<RemoteIndex>> {
        let size = reader.length()?;
        let index = Arc::new(ArchiveIndex::open(reader, size, self.config.decoder(), self.config.index).await?);
        lock(&self.index).replace(index.clone());
        // A cancel that landed while the directory was being located.
        if self.token.is_cancelled() {
            index.close();
        }
        Ok(index)
    }

    async fn extract(&self, reader: Arc<RemoteArchiveReader>, batch_limit: usize) -> Result<Vec<UnzipRecord>> {
        let index = self.open_index(reader).await?;
        let entries = match index.enumerate_entries().await {
            Ok(entries) => entries,
            Err(e) => {
                index.close();
                return Err(e);
            }
        };

        let total = entries.len();
        let tasks: Vec<ArchiveEntry> = entries
            .into_iter()
            .filter(|e| {
                if !has_path(&e.name) {
                    warn!("skipping entry {:?}: name has no usable path", e.name);
                    return false;
                }
                !(self.config.skip_directories && e.is_directory)
            })
            .collect();
        info!("{} entries, {} to upload", total, tasks.len());

        let manager = TaskManager::new(batch_limit, tasks).with_cancel_token(self.token.clone());
        let index = &*index;
        let records = manager
            .run(
                |entry| self.upload_entry(index, entry),
                |entry| debug!("not uploading {}: run cancelled", entry.name),
            )
            .await;

        index.close();
        records
    }

    async fn upload_entry<E: ZipEngine>(
        &self,
        index: &ArchiveIndex<E>,
        entry: ArchiveEntry,
    ) -> Result<UploadResult> {
        let size = entry.uncompressed_size();
        if size > self.config.max_file_size {
            return Err(Error::msg(
                ErrorKind::EntryTooLarge,
                format!(
                    "{} is {} bytes, limit is {}",
                    entry.name, size, self.config.max_file_size
                ),
            ));
        }

        let key = target_key(
            &self.config.target_prefix,
            &self.config.source.key,
            &entry.name,
            self.config.extra_root_dir,
            entry.is_directory,
        );
        let location = ObjectLocation::new(
            self.config.target_bucket.as_str(),
            self.config.target_region.as_str(),
            key.as_str(),
        );

        let stream = index.open_entry_stream(&entry).await?;
        let body = CountingReader::new(stream);
        let counter = body.counter();
        let put = self
            .store
            .put_object(&location, Box::pin(body), size)
            .await
            .map_err(|e| {
                warn!("upload of {} failed: {:#}", key, e);
                Error::new(ErrorKind::Upload, e)
            })?;

        let bytes = counter.load(Ordering::Relaxed);
        debug!("uploaded {} ({} bytes)", key, bytes);
        Ok(UploadResult {
            key,
            bytes,
            etag: put.etag,
        })
    }

    /// Close the engine, then the reader under it. Both are idempotent.
    fn release(&self) {
        if let Some(index) = lock(&self.index).take() {
            index.close();
        }
        if let Some(reader) = lock(&self.archive).take() {
            reader.close();
        }
    }
}

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reject sources that are not `.zip` files. The extension is the only check.
pub fn check_extension(key: &str) -> Result<()> {
    let is_zip = key
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case("zip"));
    if is_zip {
        Ok(())
    } else {
        Err(Error::msg(ErrorKind::UnsupportedFileType, format!("not a .zip file: {key}")))
    }
}

/// Destination key for an entry.
///
/// Joins `prefix`, optionally the archive's base name, and the entry name
/// with forward slashes. Empty, `.` and `..` segments are dropped so an
/// entry can never climb out of the prefix; directories keep a trailing `/`.
pub fn target_key(prefix: &str, archive_key: &str, name: &str, extra_root_dir: bool, is_directory: bool) -> String {
    let mut parts: Vec<&str> = segments(prefix).collect();
    if extra_root_dir {
        let file = archive_key.rsplit(['/', '\\']).next().unwrap_or(archive_key);
        let root = match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && ext.eq_ignore_ascii_case("zip") => stem,
            _ => file,
        };
        parts.extend(segments(root));
    }
    parts.extend(segments(name));

    let mut key = parts.join("/");
    if is_directory && !key.is_empty() {
        key.push('/');
    }
    key
}

/// Whether `name` keeps at least one segment once normalized.
/// Entries such as `./` or `..` would otherwise land on the bare prefix.
pub fn has_path(name: &str) -> bool {
    segments(name).next().is_some()
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\'])
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FsObjectStore, ObjectMeta, PutResult, RangeClient};
    use crate::io::ByteStream;
    use crate::zip::testing::ZipBuilder;
    use async_trait::async_trait;
    use crate::task::TaskState;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWrite;
    use tokio::sync::{Notify, Semaphore};

    #[test]
    fn accepts_only_zip_keys() {
        assert!(check_extension("a/b/archive.zip").is_ok());
        assert!(check_extension("ARCHIVE.ZIP").is_ok());
        for key in ["archive.tar.gz", "archive", "dir.zip/file", ".zip", "zip"] {
            let err = check_extension(key).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnsupportedFileType, "{key}");
        }
    }

    #[test]
    fn builds_destination_keys() {
        assert_eq!(target_key("", "in/a.zip", "x/y.txt", false, false), "x/y.txt");
        assert_eq!(target_key("out/", "in/a.zip", "x/y.txt", false, false), "out/x/y.txt");
        assert_eq!(target_key("/out", "in/a.zip", "dir/", false, true), "out/dir/");
        assert_eq!(target_key("out", "in/photos.ZIP", "x\\y.txt", true, false), "out/photos/x/y.txt");
        assert_eq!(target_key("out", "a.zip", "../../etc/passwd", false, false), "out/etc/passwd");
        assert_eq!(target_key("", "a.zip", "Folder", false, true), "Folder/");
    }

    #[test]
    fn names_without_segments_have_no_path() {
        for name in ["", "/", "./", "..", "../..", "\\.\\", "./../"] {
            assert!(!has_path(name), "{name:?}");
        }
        assert!(has_path("./a"));
        assert!(has_path("../x/"));
    }

    #[tokio::test]
    async fn pathless_entries_are_never_scheduled() {
        let zip = ZipBuilder::new()
            .directory("./")
            .stored("..", b"up")
            .stored("a.txt", b"hello")
            .finish();
        let (dir, store, mut config) = setup(zip).await;
        config.target_prefix = "out".into();

        let records = Unzipper::new(config, store.clone()).run().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].succeeded());
        assert_eq!(records[0].result.as_ref().unwrap().key, "out/a.txt");
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert!(!crate::report::RunSummary::from_records(&records).failed());
        assert_eq!(tokio::fs::read(dir.path().join("dst/out/a.txt")).await.unwrap(), b"hello");
    }

    /// Filesystem store that counts uploads.
    struct CountingStore {
        inner: FsObjectStore,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn head_object(&self, location: &ObjectLocation) -> anyhow::Result<ObjectMeta> {
            self.inner.head_object(location).await
        }

        async fn get_object(
            &self,
            location: &ObjectLocation,
            range: Option<(u64, u64)>,
            out: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> anyhow::Result<u64> {
            self.inner.get_object(location, range, out).await
        }

        async fn put_object(
            &self,
            location: &ObjectLocation,
            body: ByteStream,
            content_length: u64,
        ) -> anyhow::Result<PutResult> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put_object(location, body, content_length).await
        }

        fn range_client(&self, location: &ObjectLocation) -> anyhow::Result<Arc<dyn RangeClient>> {
            self.inner.range_client(location)
        }
    }

    async fn setup(zip: Vec<u8>) -> (tempfile::TempDir, Arc<CountingStore>, UnzipConfig) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = dir.path().join("src");
        tokio::fs::create_dir_all(&bucket).await.unwrap();
        tokio::fs::write(bucket.join("in.zip"), zip).await.unwrap();

        let store = Arc::new(CountingStore {
            inner: FsObjectStore::new(dir.path()),
            puts: AtomicUsize::new(0),
        });
        let mut config = UnzipConfig::new(ObjectLocation::new("src", "local", "in.zip"));
        config.target_bucket = "dst".into();
        config.memory_bytes = Some(1024 * 1024 * 1024);
        config.reader.cache_dir = dir.path().to_path_buf();
        (dir, store, config)
    }

    #[tokio::test]
    async fn oversize_entries_never_reach_upload() {
        let zip = ZipBuilder::new()
            .stored("small.txt", &[1u8; 100])
            .stored("big.bin", &[2u8; 200])
            .finish();
        let (dir, store, mut config) = setup(zip).await;
        config.max_file_size = 150;

        let records = Unzipper::new(config, store.clone()).run().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].succeeded());
        assert_eq!(records[1].error.as_ref().unwrap().kind(), ErrorKind::EntryTooLarge);
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("dst/big.bin").exists());
    }

    #[tokio::test]
    async fn skips_directories_when_asked() {
        let zip = ZipBuilder::new()
            .directory("docs/")
            .deflated("docs/readme.md", b"# hello\n")
            .finish();
        let (dir, store, mut config) = setup(zip).await;
        config.skip_directories = true;
        config.target_prefix = "unpacked".into();

        let records = Unzipper::new(config, store).run().await.unwrap();
        assert_eq!(records.len(), 1);
        let result = records[0].result.as_ref().unwrap();
        assert_eq!(result.key, "unpacked/docs/readme.md");
        assert_eq!(result.bytes, 8);
        let body = tokio::fs::read(dir.path().join("dst/unpacked/docs/readme.md")).await.unwrap();
        assert_eq!(body, b"# hello\n");
    }

    #[tokio::test]
    async fn cancelled_unzipper_does_not_start() {
        let zip = ZipBuilder::new().stored("a", b"a").finish();
        let (_dir, store, config) = setup(zip).await;
        let unzipper = Unzipper::new(config, store.clone());
        unzipper.cancel();
        let err = unzipper.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }

    /// Range reads that start at `held_start` wait for a permit.
    struct HeldRange {
        inner: Arc<dyn RangeClient>,
        held_start: u64,
        arrived: Arc<Notify>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl RangeClient for HeldRange {
        async fn open_range(&self, start: u64, end: u64) -> anyhow::Result<ByteStream> {
            if start == self.held_start {
                self.arrived.notify_one();
                let _permit = self.gate.acquire().await?;
            }
            self.inner.open_range(start, end).await
        }
    }

    /// Counting store whose range client holds one offset.
    struct HoldingStore {
        inner: CountingStore,
        held_start: u64,
        arrived: Arc<Notify>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ObjectStore for HoldingStore {
        async fn head_object(&self, location: &ObjectLocation) -> anyhow::Result<ObjectMeta> {
            self.inner.head_object(location).await
        }

        async fn get_object(
            &self,
            location: &ObjectLocation,
            range: Option<(u64, u64)>,
            out: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> anyhow::Result<u64> {
            self.inner.get_object(location, range, out).await
        }

        async fn put_object(
            &self,
            location: &ObjectLocation,
            body: ByteStream,
            content_length: u64,
        ) -> anyhow::Result<PutResult> {
            self.inner.put_object(location, body, content_length).await
        }

        fn range_client(&self, location: &ObjectLocation) -> anyhow::Result<Arc<dyn RangeClient>> {
            Ok(Arc::new(HeldRange {
                inner: self.inner.range_client(location)?,
                held_start: self.held_start,
                arrived: self.arrived.clone(),
                gate: self.gate.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn cancel_mid_run_closes_the_archive() {
        let zip = ZipBuilder::new()
            .stored("a.txt", &[b'a'; 100])
            .stored("b.txt", &[b'b'; 100])
            .stored("c.txt", &[b'c'; 100])
            .finish();
        let (_dir, counting, mut config) = setup(zip).await;
        config.max_concurrency = 1;
        config.reader.local_size_limit = 64;
        let counting = Arc::into_inner(counting).unwrap();
        let store = Arc::new(HoldingStore {
            inner: counting,
            // Local header of the first entry.
            held_start: 0,
            arrived: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        });

        let unzipper = Unzipper::new(config, store.clone());
        let (records, ()) = tokio::join!(unzipper.run(), async {
            store.arrived.notified().await;
            unzipper.cancel();
            store.gate.add_permits(8);
        });
        let records = records.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].state, TaskState::Failed);
        assert_eq!(records[0].error.as_ref().unwrap().kind(), ErrorKind::NotOpen);
        for record in &records[1..] {
            assert_eq!(record.state, TaskState::Cancelled);
            assert_eq!(record.error.as_ref().unwrap().kind(), ErrorKind::Cancelled);
        }
        assert_eq!(store.inner.puts.load(Ordering::SeqCst), 0);
        assert!(lock(&unzipper.index).is_none());
    }

    #[tokio::test]
    async fn lists_entries_without_uploading() {
        let zip = ZipBuilder::new()
            .stored("one", b"1")
            .stored("two", b"22")
            .finish();
        let (_dir, store, config) = setup(zip).await;
        let entries = Unzipper::new(config, store.clone()).list().await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["one", "two"]);
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }
}
