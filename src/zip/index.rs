use std::sync::Arc;

use tracing::{debug, warn};

use super::charset::{CharsetChoice, FilenameDecoder};
use super::parser::{CentralDirectory, EngineOptions};
use super::structures::ZipFileEntry;
use super::ZipEngine;
use crate::error::{Error, ErrorKind, Result, kind_of};
use crate::io::{ByteStream, ReadAt, empty_stream};
use crate::retry::{RetryPolicy, with_retry_if};

/// Retry limits for opening and enumerating an archive.
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// Attempts for locating the central directory.
    pub open_retry: RetryPolicy,
    /// Attempts per directory record before enumeration gives up.
    pub entry_attempts: u32,
    /// Failed record reads tolerated across one whole enumeration pass.
    pub max_total_retries: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            open_retry: RetryPolicy::default(),
            entry_attempts: RetryPolicy::DEFAULT_ATTEMPTS,
            max_total_retries: 16,
        }
    }
}

/// One central-directory record with its decoded name.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Position in the enumeration.
    pub index: u32,
    pub name: String,
    pub charset: CharsetChoice,
    pub is_directory: bool,
    pub header: ZipFileEntry,
}

impl ArchiveEntry {
    pub fn raw_name(&self) -> &[u8] {
        &self.header.raw_name
    }

    pub fn uncompressed_size(&self) -> u64 {
        self.header.uncompressed_size
    }
}

/// Entry listing and per-entry streams of one open archive.
pub struct ArchiveIndex<E: ZipEngine> {
    engine: E,
    decoder: FilenameDecoder,
    options: IndexOptions,
}

impl<R: ReadAt + 'static> ArchiveIndex<CentralDirectory<R>> {
    /// Locate the central directory of `reader`, retrying transient failures.
    ///
    /// The engine is opened with auto-close disabled: the connection stays
    /// up until [`close`](Self::close) so entries can be streamed after
    /// enumeration.
    pub async fn open(
        reader: Arc<R>,
        total_size: u64,
        decoder: FilenameDecoder,
        options: IndexOptions,
    ) -> Result<Self> {
        let retryable = |e: &anyhow::Error| !kind_of(e).is_some_and(ErrorKind::is_fatal);
        let engine = with_retry_if(options.open_retry, "open archive", retryable, || {
            CentralDirectory::open(reader.clone(), total_size, EngineOptions { auto_close: false })
        })
        .await
        .map_err(|e| match kind_of(&e) {
            // A reader closed under us is not a malformed archive.
            Some(ErrorKind::NotOpen) => Error::new(ErrorKind::NotOpen, e),
            _ => Error::new(ErrorKind::ArchiveParse, e),
        })?;
        Ok(Self::from_engine(engine, decoder, options))
    }
}

impl<E: ZipEngine> ArchiveIndex<E> {
    pub fn from_engine(engine: E, decoder: FilenameDecoder, options: IndexOptions) -> Self {
        Self {
            engine,
            decoder,
            options,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Read every directory record, in archive order.
    ///
    /// A failed record read is re-requested until `entry_attempts`
    /// consecutive failures, or `max_total_retries` failures over the whole
    /// pass. A closed connection fails immediately with
    /// [`ErrorKind::NotOpen`].
    pub async fn enumerate_entries(&self) -> Result<Vec<ArchiveEntry>> {
        let mut entries = Vec::new();
        let mut consecutive_errors = 0u32;
        let mut total_retries = 0u32;

        loop {
            if !self.engine.is_open() {
                return Err(Error::msg(
                    ErrorKind::NotOpen,
                    format!("archive closed after {} entries", entries.len()),
                ));
            }

            match self.engine.next_entry().await {
                Ok(Some(header)) => {
                    consecutive_errors = 0;
                    let entry = self.decode(entries.len() as u32, header);
                    debug!("entry {}: {} [{}]", entry.index, entry.name, entry.charset);
                    entries.push(entry);
                }
                Ok(None) => break,
                Err(e) => {
                    if !self.engine.is_open() {
                        return Err(Error::new(ErrorKind::NotOpen, e));
                    }
                    consecutive_errors += 1;
                    total_retries += 1;
                    if consecutive_errors >= self.options.entry_attempts.max(1)
                        || total_retries > self.options.max_total_retries
                    {
                        return Err(Error::new(ErrorKind::EntryRead, e));
                    }
                    warn!(
                        "reading entry {} failed, retry {}: {:#}",
                        entries.len(),
                        consecutive_errors,
                        e
                    );
                }
            }
        }

        Ok(entries)
    }

    fn decode(&self, index: u32, header: ZipFileEntry) -> ArchiveEntry {
        let (name, charset) = self.decoder.decode(&header.raw_name, header.has_utf8_name());
        let is_directory = name.ends_with('/') || header.has_directory_attr();
        ArchiveEntry {
            index,
            name,
            charset,
            is_directory,
            header,
        }
    }

    /// Open a stream over an entry's uncompressed data.
    ///
    /// Directories yield an empty stream without touching the engine.
    pub async fn open_entry_stream(&self, entry: &ArchiveEntry) -> Result<ByteStream> {
        if entry.is_directory {
            return Ok(empty_stream());
        }
        if !self.engine.is_open() {
            return Err(Error::msg(ErrorKind::NotOpen, "archive is closed"));
        }

        let stream = self.engine.open_read_stream(&entry.header).await;

        // The engine may have been closed while the call was in flight.
        if !self.engine.is_open() {
            return Err(Error::msg(
                ErrorKind::NotOpen,
                format!("archive closed while opening {}", entry.name),
            ));
        }
        stream.map_err(|e| match kind_of(&e) {
            Some(ErrorKind::NotOpen) => Error::new(ErrorKind::NotOpen, e),
            _ => Error::new(ErrorKind::StreamOpen, e),
        })
    }

    pub fn close(&self) {
        if self.engine.is_open() {
            self.engine.close();
        }
    }
}
