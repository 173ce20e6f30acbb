//! ZIP archive parsing and entry access.
//!
//! This module provides functionality for walking the central directory of
//! a ZIP archive behind a random-access reader and streaming its entries.
//!
//! ## Architecture
//!
//! - [`structures`]: Data structures representing ZIP format elements (EOCD, file headers, etc.)
//! - [`parser`]: The [`CentralDirectory`] engine, pulling one directory record at a time
//! - [`stream`]: Incremental inflate and CRC/length verification of entry data
//! - [`charset`]: Best-effort decoding of legacy file names
//! - [`index`]: [`ArchiveIndex`], which drives an engine with retries and decodes names
//!
//! ## ZIP Format Overview
//!
//! A ZIP file consists of:
//! 1. Local file headers and compressed data for each file
//! 2. Central Directory with metadata for all files
//! 3. End of Central Directory (EOCD) record at the end
//!
//! Reading the EOCD first, then the Central Directory, lets us list an
//! archive while touching only its tail - perfect for HTTP Range requests.
//!
//! ## Limitations
//!
//! - No encryption support
//! - No multi-disk archive support
//! - Only STORED and DEFLATE compression methods

pub mod charset;
mod index;
mod parser;
mod stream;
mod structures;
#[cfg(test)]
pub(crate) mod testing;

pub use charset::{AllowList, CharsetCandidate, CharsetChoice, CharsetDetector, ChardetngDetector, FilenameDecoder};
pub use index::{ArchiveEntry, ArchiveIndex, IndexOptions};
pub use parser::{CentralDirectory, EngineOptions};
pub use stream::{CheckedReader, InflateReader};
pub use structures::*;

use anyhow::Result;
use async_trait::async_trait;

use crate::io::ByteStream;

/// Pull-based ZIP parsing engine.
///
/// Directory records are requested one at a time; entry streams may be
/// opened concurrently with each other and with enumeration.
#[async_trait]
pub trait ZipEngine: Send + Sync {
    /// Read the next central-directory record, or `None` at the end.
    ///
    /// A failed call does not consume the record, so it can be retried.
    async fn next_entry(&self) -> Result<Option<ZipFileEntry>>;

    /// Open a decompressing stream over an entry's data.
    async fn open_read_stream(&self, entry: &ZipFileEntry) -> Result<ByteStream>;

    /// Whether the underlying connection is still usable.
    fn is_open(&self) -> bool;

    /// Close the underlying connection. Idempotent.
    fn close(&self);
}
