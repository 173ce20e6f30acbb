//! Object-storage collaborators.
//!
//! The relay never talks to a bucket directly; it goes through
//! [`ObjectStore`] for metadata, tail downloads and uploads, and through a
//! per-object [`RangeClient`] for ranged reads of the archive body.
//!
//! Two implementations ship with the crate:
//!
//! - [`HttpObjectStore`]: plain HTTP(S) against a bucket endpoint template
//! - [`FsObjectStore`]: a local directory where each bucket is a subdirectory

mod fs;
mod http;

pub use fs::FsObjectStore;
pub use http::{HttpObjectStore, HttpRangeClient};

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::io::ByteStream;

/// Address of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub region: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.region, self.bucket, self.key)
    }
}

/// Metadata returned by [`ObjectStore::head_object`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object length. Zero means empty or unknown.
    pub content_length: u64,
    pub etag: Option<String>,
}

/// Result of a completed upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutResult {
    pub etag: Option<String>,
}

/// Authenticated bucket operations used by the relay.
///
/// `head_object` and `get_object` are safe to retry; `put_object` consumes
/// a stream and is never retried by the relay.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectMeta>;

    /// Write the object (or `[start, end)` of it) into `out`, returning the
    /// number of bytes written.
    async fn get_object(
        &self,
        location: &ObjectLocation,
        range: Option<(u64, u64)>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: ByteStream,
        content_length: u64,
    ) -> Result<PutResult>;

    /// A client for unretried ranged reads of one object.
    fn range_client(&self, location: &ObjectLocation) -> Result<Arc<dyn RangeClient>>;
}

/// Ranged reads of a single object.
#[async_trait]
pub trait RangeClient: Send + Sync {
    /// Stream bytes `[start, end)`. Failures are not retried here since the
    /// returned stream may already be partially consumed when one surfaces.
    async fn open_range(&self, start: u64, end: u64) -> Result<ByteStream>;
}
