use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;

use super::{ByteStream, ReadAt};

/// Archive bytes held in memory, counting the ranges requested.
pub struct MemoryArchive {
    data: Vec<u8>,
    closed: AtomicBool,
    ranges: AtomicU64,
}

impl MemoryArchive {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            closed: AtomicBool::new(false),
            ranges: AtomicU64::new(0),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ranges_requested(&self) -> u64 {
        self.ranges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadAt for MemoryArchive {
    async fn read_range(&self, start: u64, end: u64) -> Result<ByteStream> {
        if self.is_closed() {
            bail!("closed");
        }
        self.ranges.fetch_add(1, Ordering::SeqCst);
        let end = end.min(self.data.len() as u64);
        let start = start.min(end);
        let slice = self.data[start as usize..end as usize].to_vec();
        Ok(Box::pin(std::io::Cursor::new(slice)))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
