use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use super::{ObjectLocation, ObjectMeta, ObjectStore, PutResult, RangeClient};
use crate::io::ByteStream;

/// Object store backed by a local directory.
///
/// Objects live at `<root>/<bucket>/<key>`; the region is ignored. Uploads
/// land in a temporary file next to the target and are renamed into place,
/// so a failed upload never leaves a partial object behind.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an object to its path, refusing keys that escape the bucket.
    pub fn object_path(&self, location: &ObjectLocation) -> Result<PathBuf> {
        let mut path = self.root.join(&location.bucket);
        for component in Path::new(&location.key).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => bail!("object key escapes its bucket: {}", location.key),
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectMeta> {
        let path = self.object_path(location)?;
        let meta = fs::metadata(&path)
            .await
            .with_context(|| format!("no such object: {location}"))?;
        Ok(ObjectMeta {
            content_length: meta.len(),
            etag: None,
        })
    }

    async fn get_object(
        &self,
        location: &ObjectLocation,
        range: Option<(u64, u64)>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let path = self.object_path(location)?;
        let mut file = fs::File::open(&path)
            .await
            .with_context(|| format!("no such object: {location}"))?;

        let written = match range {
            Some((start, end)) => {
                file.seek(SeekFrom::Start(start)).await?;
                let mut limited = file.take(end.saturating_sub(start));
                tokio::io::copy(&mut limited, &mut *out).await?
            }
            None => tokio::io::copy(&mut file, &mut *out).await?,
        };
        out.flush().await?;
        Ok(written)
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        mut body: ByteStream,
        content_length: u64,
    ) -> Result<PutResult> {
        let path = self.object_path(location)?;

        // Keys ending in '/' are directory markers.
        if location.key.ends_with('/') {
            let mut drained = Vec::new();
            body.read_to_end(&mut drained).await?;
            if !drained.is_empty() {
                bail!("directory object {} must have an empty body", location.key);
            }
            fs::create_dir_all(&path).await?;
            return Ok(PutResult::default());
        }

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).await?;

        let temp = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&parent)?;
        let mut file = fs::File::from_std(temp.reopen()?);
        let written = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;
        drop(file);

        if written != content_length {
            bail!(
                "upload of {} wrote {} bytes, expected {}",
                location.key,
                written,
                content_length
            );
        }

        temp.persist(&path)
            .with_context(|| format!("failed to store {}", path.display()))?;
        Ok(PutResult::default())
    }

    fn range_client(&self, location: &ObjectLocation) -> Result<Arc<dyn RangeClient>> {
        Ok(Arc::new(FsRangeClient {
            path: self.object_path(location)?,
        }))
    }
}

struct FsRangeClient {
    path: PathBuf,
}

#[async_trait]
impl RangeClient for FsRangeClient {
    async fn open_range(&self, start: u64, end: u64) -> Result<ByteStream> {
        let mut file = fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(Box::pin(file.take(end.saturating_sub(start))))
    }
}
