use std::io::SeekFrom;
use std::path::Path;

use anyhow::{Result, bail};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::ByteStream;

/// Locally cached suffix of a remote object.
///
/// Holds bytes `[start, start + len)` of the remote object in a temporary
/// file that is deleted when the cache is dropped.
pub struct TailCache {
    file: NamedTempFile,
    start: u64,
    len: u64,
}

impl TailCache {
    pub fn new(file: NamedTempFile, start: u64, len: u64) -> Self {
        Self { file, start, len }
    }

    /// Offset in the remote object where the cached bytes begin.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Positional read relative to the start of the cache.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let max = ((self.len - offset) as usize).min(buf.len());
        let buf = &mut buf[..max];

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let mut filled = 0;
            while filled < buf.len() {
                let n = self.file.as_file().read_at(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }

        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut filled = 0;
            while filled < buf.len() {
                let n = self
                    .file
                    .as_file()
                    .seek_read(&mut buf[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            Ok(filled)
        }

        #[cfg(not(any(unix, windows)))]
        {
            let _ = buf;
            bail!("positional reads are not supported on this platform")
        }
    }

    /// Stream `[start, end)` relative to the start of the cache.
    ///
    /// Each stream gets its own file handle, so concurrent streams never
    /// share a seek position.
    pub async fn open_range(&self, start: u64, end: u64) -> Result<ByteStream> {
        if end > self.len || start > end {
            bail!(
                "range {}..{} outside cached window of {} bytes",
                start,
                end,
                self.len
            );
        }
        let mut file = tokio::fs::File::open(self.file.path()).await?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(Box::pin(file.take(end - start)))
    }
}
