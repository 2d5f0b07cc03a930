//! Length-bounded body stages.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::READ_CHUNK;

/// Filler written when a fixed-length body is closed short.
const PAD: [u8; 512] = [0; 512];

/// Reads exactly `length` bytes from the inner stream, then reports EOF.
///
/// Reads are serviced in at most [`READ_CHUNK`] bytes. The peer closing the
/// stream before `length` bytes arrived is an `UnexpectedEof` error.
#[derive(Debug)]
pub struct LengthLimitedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R> LengthLimitedReader<R> {
    pub fn new(inner: R, length: u64) -> Self {
        Self {
            inner,
            remaining: length,
        }
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LengthLimitedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let max = (self.remaining.min(READ_CHUNK as u64) as usize).min(buf.remaining());
        let n = {
            let dst = buf.initialize_unfilled_to(max);
            let mut sub = ReadBuf::new(dst);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut sub))?;
            sub.filled().len()
        };

        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("body ended with {} bytes outstanding", self.remaining),
            )));
        }

        buf.advance(n);
        self.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Writes a body of exactly `length` bytes.
///
/// Bytes beyond the declared length are discarded. Shutting the stage down
/// pads any shortfall with filler so the peer's framing stays exact, then
/// flushes the inner stream without closing it.
#[derive(Debug)]
pub struct LengthLimitedWriter<W> {
    inner: W,
    remaining: u64,
    truncated: u64,
}

impl<W> LengthLimitedWriter<W> {
    pub fn new(inner: W, length: u64) -> Self {
        Self {
            inner,
            remaining: length,
            truncated: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Bytes the caller wrote past the declared length.
    pub fn truncated(&self) -> u64 {
        self.truncated
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for LengthLimitedWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.remaining == 0 {
            self.truncated += buf.len() as u64;
            return Poll::Ready(Ok(buf.len()));
        }
        let max = (self.remaining.min(buf.len() as u64)) as usize;
        let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &buf[..max]))?;
        self.remaining -= n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.remaining > 0 {
            let max = self.remaining.min(PAD.len() as u64) as usize;
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &PAD[..max]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.remaining -= n as u64;
        }
        if self.truncated > 0 {
            tracing::warn!(truncated = self.truncated, "Body exceeded declared length");
            self.truncated = 0;
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }
}
