//! # unzip-relay
//!
//! Extract a ZIP archive that lives in object storage and re-upload each of
//! its entries as a separate object, without downloading the whole archive.
//!
//! The archive's tail, where the central directory lives, is fetched once
//! and cached on local disk. Everything before it is read with ranged
//! requests, one stream per entry, so many entries can be uploaded at once
//! while only a bounded amount of data is held locally.
//!
//! ## Features
//!
//! - Random access to remote archives via HTTP Range requests
//! - Support for ZIP64 format (archives larger than 4GB)
//! - Streaming STORED and DEFLATE entries with CRC-32 verification
//! - Charset detection for legacy (non-UTF-8) file names
//! - Memory-sized bounded concurrency with cooperative cancellation
//! - Per-entry failure isolation and a run summary
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use unzip_relay::{FsObjectStore, ObjectLocation, RunSummary, UnzipConfig, Unzipper};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(FsObjectStore::new("./buckets"));
//!     let mut config = UnzipConfig::new(ObjectLocation::new("incoming", "", "photos.zip"));
//!     config.target_prefix = "unpacked/".to_string();
//!
//!     let records = Unzipper::new(config, store).run().await?;
//!     print!("{}", RunSummary::from_records(&records));
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod io;
pub mod report;
pub mod retry;
pub mod storage;
pub mod task;
pub mod unzip;
pub mod zip;

pub use cli::Cli;
pub use error::{Error, ErrorKind, Result, describe_error};
pub use io::{ReadAt, RemoteArchiveReader};
pub use report::RunSummary;
pub use storage::{FsObjectStore, HttpObjectStore, ObjectLocation, ObjectStore};
pub use task::{TaskManager, TaskRecord, TaskState};
pub use unzip::{UnzipConfig, Unzipper, UploadResult};
pub use zip::{ArchiveEntry, ArchiveIndex, ZipFileEntry};
