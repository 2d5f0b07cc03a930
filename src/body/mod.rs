//! Body stream layer.
//!
//! # Data Flow
//! ```text
//! request:  wire → LengthLimitedReader | ChunkedReader → DecoderReader* → handler
//! response: handler → GzipWriter? → LengthLimitedWriter | ChunkedWriter | wire → wire
//! ```
//!
//! # Design Decisions
//! - Every stage is a plain `AsyncRead` / `AsyncWrite` wrapper that owns the
//!   stage beneath it, so chains compose in header order.
//! - Readers never consume bytes past their own framing; reading a chain to
//!   EOF leaves a shared connection at the first byte of the next request.
//! - `poll_shutdown` on a writer stage finishes that stage's framing and
//!   shuts down the stage beneath it. The bottom stages only flush: closing a
//!   body must not close a keep-alive socket.
//! - The bottom request stage is a [`ReadTimeout`], so a peer that stops
//!   sending mid-body cannot hold the connection forever.

pub mod chunked;
pub mod compression;
pub mod limited;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

pub use chunked::{ChunkedReader, ChunkedWriter};
pub use compression::{
    decode_content_codings, is_corrupt_coding, ContentCoding, DecoderReader, GzipWriter,
};
pub use limited::{LengthLimitedReader, LengthLimitedWriter};

/// Upper bound on a single read pulled from the connection.
pub const READ_CHUNK: usize = 10 * 1024;

/// A boxed request-side stage.
///
/// `Sync` so a `&Request` can be held across an await inside a spawned task.
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// A boxed response-side stage.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read a body stage to EOF, discarding the bytes.
pub async fn drain<R>(reader: &mut R) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::io::copy(reader, &mut tokio::io::sink()).await
}

/// Fails a read with `TimedOut` when the peer sends nothing for `period`.
///
/// The clock only runs while a read is waiting on the peer; time the
/// consumer spends elsewhere does not count.
pub struct ReadTimeout<R> {
    inner: R,
    period: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    armed: bool,
}

impl<R> ReadTimeout<R> {
    pub fn new(inner: R, period: Duration) -> Self {
        Self {
            inner,
            period,
            sleep: None,
            armed: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadTimeout<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if let Poll::Ready(result) = Pin::new(&mut this.inner).poll_read(cx, buf) {
            this.armed = false;
            return Poll::Ready(result);
        }

        let period = this.period;
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(period)));
        if !this.armed {
            sleep.as_mut().reset(Instant::now() + period);
            this.armed = true;
        }
        ready!(sleep.as_mut().poll(cx));
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer sent no body bytes within the read timeout",
        )))
    }
}

/// Close-delimited body stage: passes bytes straight through and only
/// flushes on shutdown. The connection itself is closed by the response.
#[derive(Debug)]
pub struct Unframed<W> {
    inner: W,
}

impl<W> Unframed<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Unframed<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
}

/// Body stage for responses that must not carry bytes (HEAD, 204, 304).
///
/// Writes are accepted and dropped; flush and shutdown flush the inner
/// stream so the already-written head reaches the peer.
#[derive(Debug)]
pub struct Discard<W> {
    inner: W,
}

impl<W> Discard<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for Discard<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn drain_consumes_only_the_stage() {
        let data: &[u8] = b"bodyNEXT";
        let mut limited = LengthLimitedReader::new(data, 4);
        assert_eq!(drain(&mut limited).await.unwrap(), 4);
        assert_eq!(limited.into_inner(), b"NEXT");
    }

    #[tokio::test]
    async fn read_timeout_counts_only_time_spent_waiting() {
        let (mut peer, io) = tokio::io::duplex(64);
        let mut reader = ReadTimeout::new(io, Duration::from_millis(50));

        peer.write_all(b"ab").await.unwrap();
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await.unwrap();

        // Busy elsewhere for longer than the period.
        tokio::time::sleep(Duration::from_millis(120)).await;
        peer.write_all(b"c").await.unwrap();
        let mut one = [0u8; 1];
        reader.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"c");

        let err = reader.read(&mut one).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        drop(peer);
    }

    #[tokio::test]
    async fn discard_drops_bytes() {
        let mut out = Vec::new();
        let mut stage = Discard::new(&mut out);
        stage.write_all(b"ignored").await.unwrap();
        stage.shutdown().await.unwrap();
        assert!(out.is_empty());
    }
}
