//! Connection I/O plumbing.
//!
//! # Responsibilities
//! - Erase plaintext vs TLS streams behind one boxed type
//! - Share one connection between a request body reader and a response
//!   writer without lifetimes (`WireReader` / `WireWriter`)
//! - Replay already-buffered bytes when a connection changes protocol
//!   (`Rewind`)
//!
//! # Design Decisions
//! - The read side is buffered so byte-at-a-time head parsing does not cost a
//!   syscall per byte; body stages never read past their own framing, which
//!   keeps pipelined requests intact in the shared buffer.
//! - Locks are only held inside a single `poll_*` call, never across awaits.
//! - Detaching takes both halves out; every later read or write through the
//!   old handles fails with `NotConnected`.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf, ReadHalf, WriteHalf,
};

/// Any bidirectional byte stream the server can speak HTTP over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A type-erased connection stream (TCP or TLS-over-TCP).
pub type BoxedIo = Box<dyn Io>;

type Reader = BufReader<ReadHalf<BoxedIo>>;
type Writer = BufWriter<WriteHalf<BoxedIo>>;

/// One connection split into shareable read and write handles.
#[derive(Clone)]
pub struct Wire {
    reader: Arc<Mutex<Option<Reader>>>,
    writer: Arc<Mutex<Option<Writer>>>,
}

impl Wire {
    pub fn new(io: BoxedIo) -> Self {
        Self::with_prefix(io, Bytes::new())
    }

    /// Wrap a stream whose first bytes were already read by someone else.
    pub fn with_prefix(io: BoxedIo, prefix: Bytes) -> Self {
        let io: BoxedIo = if prefix.is_empty() {
            io
        } else {
            Box::new(Rewind::new_buffered(io, prefix))
        };
        let (read_half, write_half) = tokio::io::split(io);
        Self {
            reader: Arc::new(Mutex::new(Some(BufReader::new(read_half)))),
            writer: Arc::new(Mutex::new(Some(BufWriter::new(write_half)))),
        }
    }

    pub fn reader(&self) -> WireReader {
        WireReader {
            inner: Arc::clone(&self.reader),
        }
    }

    pub fn writer(&self) -> WireWriter {
        WireWriter {
            inner: Arc::clone(&self.writer),
        }
    }

    /// True once the raw stream has been handed off.
    pub fn is_detached(&self) -> bool {
        lock(&self.reader).is_none() || lock(&self.writer).is_none()
    }

    /// Take the raw stream out, flushing pending writes and preserving any
    /// bytes that were read ahead into the buffer.
    ///
    /// Returns `None` if the stream was already detached.
    pub async fn detach(&self) -> io::Result<Option<Rewind<BoxedIo>>> {
        let writer = lock(&self.writer).take();
        let reader = lock(&self.reader).take();
        let (mut writer, reader) = match (writer, reader) {
            (Some(w), Some(r)) => (w, r),
            _ => return Ok(None),
        };
        writer.flush().await?;
        let buffered = Bytes::copy_from_slice(reader.buffer());
        let io = reader.into_inner().unsplit(writer.into_inner());
        Ok(Some(Rewind::new_buffered(io, buffered)))
    }

    /// Shut the write side down, closing the connection for the peer.
    pub async fn shutdown(&self) -> io::Result<()> {
        let mut writer = self.writer();
        writer.flush().await?;
        writer.shutdown().await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A poisoned lock only means another task panicked mid-poll; the stream
    // state itself is still usable for tearing the connection down.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn detached() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection handed off")
}

/// Read handle onto a shared connection.
#[derive(Clone)]
pub struct WireReader {
    inner: Arc<Mutex<Option<Reader>>>,
}

impl AsyncRead for WireReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut guard = lock(&self.inner);
        match guard.as_mut() {
            Some(reader) => Pin::new(reader).poll_read(cx, buf),
            None => Poll::Ready(Err(detached())),
        }
    }
}

/// Write handle onto a shared connection.
#[derive(Clone)]
pub struct WireWriter {
    inner: Arc<Mutex<Option<Writer>>>,
}

impl AsyncWrite for WireWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut guard = lock(&self.inner);
        match guard.as_mut() {
            Some(writer) => Pin::new(writer).poll_write(cx, buf),
            None => Poll::Ready(Err(detached())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = lock(&self.inner);
        match guard.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Err(detached())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = lock(&self.inner);
        match guard.as_mut() {
            Some(writer) => Pin::new(writer).poll_shutdown(cx),
            None => Poll::Ready(Err(detached())),
        }
    }
}

/// A stream that yields a fixed prefix before reading from the inner stream.
#[derive(Debug)]
pub struct Rewind<T> {
    prefix: Bytes,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(inner: T) -> Self {
        Self::new_buffered(inner, Bytes::new())
    }

    pub fn new_buffered(inner: T, prefix: Bytes) -> Self {
        Self { prefix, inner }
    }

    /// Put bytes back in front of whatever is still pending.
    pub fn rewind(&mut self, bytes: Bytes) {
        if self.prefix.is_empty() {
            self.prefix = bytes;
        } else {
            let mut joined = Vec::with_capacity(bytes.len() + self.prefix.len());
            joined.extend_from_slice(&bytes);
            joined.extend_from_slice(&self.prefix);
            self.prefix = Bytes::from(joined);
        }
    }

    pub fn into_inner(self) -> (T, Bytes) {
        (self.inner, self.prefix)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
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
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn rewind_replays_prefix_first() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();
        drop(server);

        let mut rewind = Rewind::new_buffered(client, Bytes::from_static(b"hello"));
        let mut out = String::new();
        rewind.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn detach_keeps_read_ahead_bytes() {
        let (client, mut peer) = tokio::io::duplex(256);
        peer.write_all(b"AB").await.unwrap();

        let wire = Wire::new(Box::new(client));
        let mut reader = wire.reader();
        assert_eq!(reader.read_u8().await.unwrap(), b'A');

        let mut raw = wire.detach().await.unwrap().expect("first detach");
        assert!(wire.is_detached());
        assert_eq!(raw.read_u8().await.unwrap(), b'B');

        let err = reader.read_u8().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
