//! Streaming readers for entry data.
//!
//! Entry bodies are never buffered whole: DEFLATE data is inflated as it is
//! pulled through [`InflateReader`], and [`CheckedReader`] verifies the
//! CRC-32 and length recorded in the central directory once the stream ends.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use flate2::{Crc, Decompress, FlushDecompress, Status};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

/// Incremental raw-DEFLATE decoder over an async buffered reader.
pub struct InflateReader<R> {
    inner: R,
    state: Decompress,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> InflateReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            // ZIP members carry raw deflate data without a zlib header.
            state: Decompress::new(false),
            done: false,
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for InflateReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.done || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            let input = ready!(Pin::new(&mut this.inner).poll_fill_buf(cx))?;
            let eof = input.is_empty();
            let flush = if eof {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };

            let in_before = this.state.total_in();
            let out_before = this.state.total_out();
            let status = this
                .state
                .decompress(input, buf.initialize_unfilled(), flush)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (this.state.total_in() - in_before) as usize;
            let produced = (this.state.total_out() - out_before) as usize;

            Pin::new(&mut this.inner).consume(consumed);
            buf.advance(produced);

            if status == Status::StreamEnd {
                this.done = true;
                return Poll::Ready(Ok(()));
            }
            if produced > 0 {
                return Poll::Ready(Ok(()));
            }
            if eof {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "deflate stream ended before its final block",
                )));
            }
            if consumed == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "deflate decoder made no progress",
                )));
            }
        }
    }
}

/// Verifies length and CRC-32 of the bytes read through it.
pub struct CheckedReader<R> {
    inner: R,
    crc: Crc,
    read: u64,
    expected_size: u64,
    expected_crc: u32,
}

impl<R> CheckedReader<R> {
    pub fn new(inner: R, expected_size: u64, expected_crc: u32) -> Self {
        Self {
            inner,
            crc: Crc::new(),
            read: 0,
            expected_size,
            expected_crc,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CheckedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let had_room = buf.remaining() > 0;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let fresh = &buf.filled()[before..];
        this.crc.update(fresh);
        this.read += fresh.len() as u64;

        if this.read > this.expected_size {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry is longer than its recorded {} bytes", this.expected_size),
            )));
        }

        if had_room && fresh.is_empty() {
            if this.read != this.expected_size {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "entry ended after {} of {} bytes",
                        this.read, this.expected_size
                    ),
                )));
            }
            if this.crc.sum() != this.expected_crc {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "crc mismatch: expected {:08x}, got {:08x}",
                        this.expected_crc,
                        this.crc.sum()
                    ),
                )));
            }
        }
        Poll::Ready(Ok(()))
    }
}
