//! Transport wrapper that keeps reads aligned to TLS record boundaries.
//!
//! After the Proxy command the peer stops speaking TLS and sends raw bytes on
//! the same socket. A TLS library reading ahead into its own buffer would
//! swallow the first of those bytes. [`RecordAligned`] never hands the TLS
//! layer more than the rest of the current record, so once the layer is
//! discarded the raw transport is positioned exactly after the last record.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// TLS record header: content type (1), legacy version (2), length (2).
const RECORD_HEADER_LEN: usize = 5;

/// Wraps a transport so that reads stop at TLS record boundaries.
#[derive(Debug)]
pub struct RecordAligned<S> {
    inner: S,
    header: [u8; RECORD_HEADER_LEN],
    header_len: usize,
    /// Payload bytes of the current record not yet read.
    remaining: usize,
}

impl<S> RecordAligned<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            header: [0; RECORD_HEADER_LEN],
            header_len: 0,
            remaining: 0,
        }
    }

    /// True when no record is partially read.
    pub fn at_boundary(&self) -> bool {
        self.header_len == 0
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Most bytes the next read may return without crossing a boundary.
    fn read_limit(&self) -> usize {
        if self.header_len < RECORD_HEADER_LEN {
            RECORD_HEADER_LEN - self.header_len
        } else {
            self.remaining
        }
    }

    fn consume(&mut self, data: &[u8]) {
        if self.header_len < RECORD_HEADER_LEN {
            let end = self.header_len + data.len();
            self.header[self.header_len..end].copy_from_slice(data);
            self.header_len = end;
            if self.header_len == RECORD_HEADER_LEN {
                self.remaining = usize::from(u16::from_be_bytes([self.header[3], self.header[4]]));
            }
        } else {
            self.remaining -= data.len();
        }

        if self.header_len == RECORD_HEADER_LEN && self.remaining == 0 {
            self.header_len = 0;
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordAligned<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let limit = this.read_limit().min(buf.remaining());
        if limit == 0 {
            return Poll::Ready(Ok(()));
        }

        let n = {
            let dst = buf.initialize_unfilled_to(limit);
            let mut limited = ReadBuf::new(dst);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
            let filled = limited.filled();
            this.consume(filled);
            filled.len()
        };

        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordAligned<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
