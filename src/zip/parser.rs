//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures,
//! reading from any source that implements the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Walk the Central Directory one record per [`next_entry`] call
//! 4. For extraction, read each file's Local File Header and stream its data
//!
//! Directory records are pulled on demand rather than read in one pass, so
//! a transient read failure costs one record, not the whole listing.
//!
//! [`next_entry`]: ZipEngine::next_entry

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::sync::Mutex;
use tracing::debug;

use super::ZipEngine;
use super::stream::{CheckedReader, InflateReader};
use super::structures::*;
use crate::io::{ByteStream, ReadAt};

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// Read buffer for compressed entry data.
const INFLATE_BUFFER_SIZE: usize = 64 * 1024;

/// Engine behaviour switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Close the engine (and its reader) once the last record has been read.
    pub auto_close: bool,
}

/// Position of the next unread central-directory record.
struct DirectoryCursor {
    offset: u64,
    remaining: u64,
}

/// Central-directory walker and entry opener over a [`ReadAt`] source.
///
/// File names are handed out as raw bytes; decoding them is the caller's job.
pub struct CentralDirectory<R: ReadAt> {
    /// The underlying data source
    reader: Arc<R>,
    /// Total size of the archive in bytes
    size: u64,
    total_entries: u64,
    cd_end: u64,
    options: EngineOptions,
    open: AtomicBool,
    cursor: Mutex<DirectoryCursor>,
}

impl<R: ReadAt> CentralDirectory<R> {
    /// Locate the central directory of an archive of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid EOCD can be found or the directory
    /// lies outside the archive.
    pub async fn open(reader: Arc<R>, size: u64, options: EngineOptions) -> Result<Self> {
        let (eocd, eocd_offset) = find_eocd(reader.as_ref(), size).await?;

        // Get Central Directory info, using ZIP64 if needed
        let (cd_offset, cd_size, total_entries) = if eocd.is_zip64() {
            let eocd64 = read_zip64_eocd(reader.as_ref(), eocd_offset).await?;
            (eocd64.cd_offset, eocd64.cd_size, eocd64.total_entries)
        } else {
            (
                eocd.cd_offset as u64,
                eocd.cd_size as u64,
                eocd.total_entries as u64,
            )
        };

        let cd_end = cd_offset.saturating_add(cd_size);
        if cd_end > eocd_offset {
            bail!(
                "Central Directory {}..{} overlaps the end record at {}",
                cd_offset,
                cd_end,
                eocd_offset
            );
        }
        if total_entries > 0 && cd_size < total_entries.saturating_mul(CDFH_MIN_SIZE as u64) {
            bail!("Central Directory too small for {} entries", total_entries);
        }

        debug!(
            "central directory at {}..{} with {} entries",
            cd_offset, cd_end, total_entries
        );

        Ok(Self {
            reader,
            size,
            total_entries,
            cd_end,
            options,
            open: AtomicBool::new(true),
            cursor: Mutex::new(DirectoryCursor {
                offset: cd_offset,
                remaining: total_entries,
            }),
        })
    }

    /// Number of records the end-of-directory claims.
    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    /// Get a reference to the underlying reader.
    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }

    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.reader.read_at(offset, &mut buf).await?;
        if n != len {
            bail!("Unexpected end of archive at offset {}", offset + n as u64);
        }
        Ok(buf)
    }

    /// Get the actual data offset for a file entry.
    ///
    /// The Local File Header (LFH) has variable-length fields (filename,
    /// extra field) that may differ from the Central Directory entry.
    /// This method reads the LFH to calculate where the actual file
    /// data begins.
    pub async fn get_data_offset(&self, entry: &ZipFileEntry) -> Result<u64> {
        let lfh_buf = self.read_exact_at(entry.lfh_offset, LFH_SIZE).await?;

        // Verify LFH signature (PK\x03\x04)
        if &lfh_buf[0..4] != LFH_SIGNATURE {
            bail!("Invalid Local File Header");
        }

        // Read the variable field lengths from fixed positions in LFH
        let mut cursor = Cursor::new(&lfh_buf);
        cursor.set_position(26); // Offset to filename length field

        let file_name_length = cursor.read_u16::<LittleEndian>()? as u64;
        let extra_field_length = cursor.read_u16::<LittleEndian>()? as u64;

        // Data starts after: LFH (30 bytes) + filename + extra field
        Ok(entry.lfh_offset + LFH_SIZE as u64 + file_name_length + extra_field_length)
    }
}

#[async_trait]
impl<R: ReadAt + 'static> ZipEngine for CentralDirectory<R> {
    async fn next_entry(&self) -> Result<Option<ZipFileEntry>> {
        if !self.is_open() {
            bail!("archive is closed");
        }

        let mut cursor = self.cursor.lock().await;
        if cursor.remaining == 0 {
            if self.options.auto_close {
                self.close();
            }
            return Ok(None);
        }
        if cursor.offset + CDFH_MIN_SIZE as u64 > self.cd_end {
            bail!("Central Directory ended before all {} entries", self.total_entries);
        }

        let fixed = self.read_exact_at(cursor.offset, CDFH_MIN_SIZE).await?;
        let variable_len = variable_length(&fixed)?;
        let rest = self
            .read_exact_at(cursor.offset + CDFH_MIN_SIZE as u64, variable_len)
            .await?;

        let mut record = fixed;
        record.extend_from_slice(&rest);
        let entry = parse_cdfh(&mut Cursor::new(&record))?;

        // Advance only once the record parsed, so a failed read is re-read.
        cursor.offset += record.len() as u64;
        cursor.remaining -= 1;
        Ok(Some(entry))
    }

    async fn open_read_stream(&self, entry: &ZipFileEntry) -> Result<ByteStream> {
        if !self.is_open() {
            bail!("archive is closed");
        }
        if entry.is_encrypted() {
            bail!("Encrypted entries are not supported");
        }

        let data_offset = self.get_data_offset(entry).await?;
        let data_end = data_offset.saturating_add(entry.compressed_size);
        if data_end > self.size {
            bail!("Entry data {}..{} runs past end of archive", data_offset, data_end);
        }

        let raw = self.reader.read_range(data_offset, data_end).await?;
        let stream: ByteStream = match entry.compression_method {
            CompressionMethod::Stored => {
                if entry.compressed_size != entry.uncompressed_size {
                    bail!("Stored entry has mismatched sizes");
                }
                raw
            }
            CompressionMethod::Deflate => Box::pin(InflateReader::new(BufReader::with_capacity(
                INFLATE_BUFFER_SIZE,
                raw,
            ))),
            CompressionMethod::Unknown(method) => {
                bail!("Unsupported compression method: {}", method)
            }
        };

        Ok(Box::pin(CheckedReader::new(
            stream,
            entry.uncompressed_size,
            entry.crc32,
        )))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.reader.close();
        }
    }
}

/// Find and parse the End of Central Directory record.
///
/// The EOCD is located at the end of the ZIP file. This handles both the
/// simple case (no comment) and archives with comments by searching
/// backwards for the signature.
async fn find_eocd<R: ReadAt + ?Sized>(reader: &R, size: u64) -> Result<(EndOfCentralDirectory, u64)> {
    // Optimization: First try the simple case where there's no comment.
    // This avoids reading extra data in the common case.
    if size >= EndOfCentralDirectory::SIZE as u64 {
        let offset = size - EndOfCentralDirectory::SIZE as u64;
        let mut buf = vec![0u8; EndOfCentralDirectory::SIZE];
        let n = reader.read_at(offset, &mut buf).await?;

        // Check for signature and zero-length comment
        if n == buf.len() && &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
            let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
            return Ok((eocd, offset));
        }
    }

    // EOCD not at expected location - search for it.
    // The EOCD could be earlier if there's a ZIP comment.
    let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64).min(size);
    let search_start = size - search_size;

    let mut buf = vec![0u8; search_size as usize];
    let n = reader.read_at(search_start, &mut buf).await?;
    buf.truncate(n);

    // Search backwards for EOCD signature (PK\x05\x06)
    if buf.len() >= EndOfCentralDirectory::SIZE {
        for i in (0..=buf.len() - EndOfCentralDirectory::SIZE).rev() {
            if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                // The comment length field should match the remaining bytes.
                let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;

                if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd =
                        EndOfCentralDirectory::from_bytes(&buf[i..i + EndOfCentralDirectory::SIZE])?;
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }
    }

    bail!("Not a valid ZIP file")
}

/// Read the ZIP64 End of Central Directory record.
///
/// The ZIP64 EOCD Locator is located immediately before the regular EOCD.
async fn read_zip64_eocd<R: ReadAt + ?Sized>(reader: &R, eocd_offset: u64) -> Result<Zip64EOCD> {
    if eocd_offset < Zip64EOCDLocator::SIZE as u64 {
        bail!("Invalid ZIP64 format");
    }
    let locator_offset = eocd_offset - Zip64EOCDLocator::SIZE as u64;
    let mut locator_buf = vec![0u8; Zip64EOCDLocator::SIZE];
    reader.read_at(locator_offset, &mut locator_buf).await?;

    let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;

    let mut eocd64_buf = vec![0u8; Zip64EOCD::MIN_SIZE];
    reader.read_at(locator.eocd64_offset, &mut eocd64_buf).await?;

    Zip64EOCD::from_bytes(&eocd64_buf)
}

/// Length of the name, extra field and comment following a fixed CDFH.
fn variable_length(fixed: &[u8]) -> Result<usize> {
    if fixed.len() < CDFH_MIN_SIZE || &fixed[0..4] != CDFH_SIGNATURE {
        bail!("Invalid Central Directory File Header");
    }
    let field = |at: usize| u16::from_le_bytes([fixed[at], fixed[at + 1]]) as usize;
    Ok(field(28) + field(30) + field(32))
}

/// Parse one complete Central Directory File Header record.
fn parse_cdfh(cursor: &mut Cursor<&Vec<u8>>) -> Result<ZipFileEntry> {
    // Read and verify the signature (PK\x01\x02)
    let mut sig = [0u8; 4];
    cursor.read_exact(&mut sig)?;
    if sig != CDFH_SIGNATURE {
        bail!("Invalid Central Directory File Header");
    }

    // Read fixed-size header fields
    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let _file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

    // Names stay raw; decoding happens once the charset is known.
    let mut raw_name = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut raw_name)?;

    // Parse extra field for ZIP64 extended information (header ID 0x0001)
    let extra_field_end = cursor.position() + extra_field_length as u64;

    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let field_size = cursor.read_u16::<LittleEndian>()?;
        let field_end = (cursor.position() + field_size as u64).min(extra_field_end);

        if header_id == 0x0001 {
            // Fields are present only if corresponding header field is 0xFFFFFFFF
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>()?;
            }
        }
        cursor.set_position(field_end);
    }

    Ok(ZipFileEntry {
        raw_name,
        flags,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        lfh_offset,
        last_mod_time,
        last_mod_date,
        external_attrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryArchive;
    use crate::zip::testing::ZipBuilder;
    use tokio::io::AsyncReadExt;

    async fn engine(bytes: Vec<u8>) -> CentralDirectory<MemoryArchive> {
        let size = bytes.len() as u64;
        CentralDirectory::open(Arc::new(MemoryArchive::new(bytes)), size, EngineOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn walks_directory_in_order() {
        let zip = ZipBuilder::new()
            .stored("a.txt", b"alpha")
            .directory("dir/")
            .deflated("dir/b.txt", &[b'b'; 300])
            .finish();
        let engine = engine(zip).await;
        assert_eq!(engine.total_entries(), 3);

        let mut names = Vec::new();
        while let Some(entry) = engine.next_entry().await.unwrap() {
            names.push(String::from_utf8(entry.raw_name).unwrap());
        }
        assert_eq!(names, ["a.txt", "dir/", "dir/b.txt"]);
        assert!(engine.next_entry().await.unwrap().is_none());
        assert!(engine.is_open());
    }

    #[tokio::test]
    async fn finds_eocd_behind_comment() {
        let zip = ZipBuilder::new()
            .stored("x", b"1")
            .comment(b"archive comment")
            .finish();
        let engine = engine(zip).await;
        assert_eq!(engine.total_entries(), 1);
    }

    #[tokio::test]
    async fn streams_stored_and_deflated_entries() {
        let body: Vec<u8> = (0..5000u32).map(|i| (i * 7 % 256) as u8).collect();
        let zip = ZipBuilder::new()
            .stored("s.bin", &body)
            .deflated("d.bin", &body)
            .finish();
        let engine = engine(zip).await;

        while let Some(entry) = engine.next_entry().await.unwrap() {
            let mut stream = engine.open_read_stream(&entry).await.unwrap();
            let mut out = Vec::new();
            stream.read_to_end(&mut out).await.unwrap();
            assert_eq!(out, body);
        }
    }

    #[tokio::test]
    async fn auto_close_after_last_entry() {
        let zip = ZipBuilder::new().stored("only", b"1").finish();
        let size = zip.len() as u64;
        let engine = CentralDirectory::open(
            Arc::new(MemoryArchive::new(zip)),
            size,
            EngineOptions { auto_close: true },
        )
        .await
        .unwrap();
        assert!(engine.next_entry().await.unwrap().is_some());
        assert!(engine.next_entry().await.unwrap().is_none());
        assert!(!engine.is_open());
        assert!(engine.next_entry().await.is_err());
    }

    #[tokio::test]
    async fn rejects_non_zip_data() {
        let data = vec![0u8; 4096];
        let res = CentralDirectory::open(
            Arc::new(MemoryArchive::new(data)),
            4096,
            EngineOptions::default(),
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn closed_engine_refuses_streams() {
        let zip = ZipBuilder::new().stored("a", b"1").finish();
        let engine = engine(zip).await;
        let entry = engine.next_entry().await.unwrap().unwrap();
        engine.close();
        engine.close();
        assert!(engine.open_read_stream(&entry).await.is_err());
        assert!(engine.reader().is_closed());
    }
}
